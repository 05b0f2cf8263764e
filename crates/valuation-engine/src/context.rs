//! 评估上下文与字段解析
//!
//! 调用方把商品字段和关联实体组装成一个可按点号路径寻址的映射，
//! 例如 `ram_gb`、`condition`、`cpu.cpu_mark_multi`、`custom.<field>`。
//! 引擎本身从不主动读取数据。

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// 顶层字段来源
///
/// 只负责按名称返回顶层字段，嵌套路径由 [`resolve_path`] 按结构逐级下钻。
pub trait FieldSource {
    fn get(&self, name: &str) -> Option<&Value>;

    /// 顶层字段名列表，仅用于错误提示中的相近字段建议
    fn field_names(&self) -> Vec<&str> {
        Vec::new()
    }
}

impl FieldSource for Map<String, Value> {
    fn get(&self, name: &str) -> Option<&Value> {
        Map::get(self, name)
    }

    fn field_names(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }
}

impl FieldSource for HashMap<String, Value> {
    fn get(&self, name: &str) -> Option<&Value> {
        HashMap::get(self, name)
    }

    fn field_names(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }
}

impl FieldSource for Value {
    fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(name),
            _ => None,
        }
    }

    fn field_names(&self) -> Vec<&str> {
        match self {
            Value::Object(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// 按路径片段解析字段
///
/// 任意一级缺失或为 `null` 都返回 `None`，调用方据此按“不匹配”处理。
pub fn resolve_path<'a, S>(source: &'a S, path: &[&str]) -> Option<&'a Value>
where
    S: FieldSource + ?Sized,
{
    let (head, rest) = path.split_first()?;
    let value = source.get(head)?;
    descend(value, rest)
}

fn descend<'a>(value: &'a Value, rest: &[&str]) -> Option<&'a Value> {
    if value.is_null() {
        return None;
    }

    let Some((head, tail)) = rest.split_first() else {
        return Some(value);
    };

    let next = match value {
        Value::Object(map) => map.get(*head)?,
        // 支持数组索引访问，如 "gpus.0.name"
        Value::Array(arr) => arr.get(head.parse::<usize>().ok()?)?,
        _ => return None,
    };

    descend(next, tail)
}

/// 解析点号分隔的字段路径
///
/// 先尝试把整个路径当作顶层键（调用方可能已经把关联字段拍平成 `cpu.cpu_mark_multi`），
/// 找不到时再按片段逐级下钻。
pub fn resolve<'a, S>(source: &'a S, dotted: &str) -> Option<&'a Value>
where
    S: FieldSource + ?Sized,
{
    if dotted.contains('.') {
        if let Some(value) = source.get(dotted).filter(|v| !v.is_null()) {
            return Some(value);
        }
    }

    let segments: Vec<&str> = dotted.split('.').collect();
    resolve_path(source, &segments)
}

/// 评估上下文 - 提供给规则引擎的数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationContext {
    data: Map<String, Value>,
}

impl EvaluationContext {
    /// 从 JSON 值创建，非对象值视为空上下文
    pub fn new(data: Value) -> Self {
        match data {
            Value::Object(map) => Self { data: map },
            _ => Self::default(),
        }
    }

    /// 从 JSON 对象创建
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let data: Value = serde_json::from_str(json)?;
        Ok(Self::new(data))
    }

    /// 设置顶层字段
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// 获取字段值（支持点号分隔的路径，如 "cpu.cpu_mark_multi"）
    pub fn get_field(&self, path: &str) -> Option<&Value> {
        resolve(self, path)
    }

    /// 获取底层数据
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.data)
    }

    /// 列出上下文中所有可寻址的叶子路径
    ///
    /// 供公式校验时作为可用字段集合使用。
    pub fn available_fields(&self) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        for (key, value) in &self.data {
            collect_paths(key, value, &mut fields);
        }
        fields
    }
}

fn collect_paths(prefix: &str, value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                collect_paths(&format!("{}.{}", prefix, key), child, out);
            }
        }
        _ => {
            out.insert(prefix.to_string());
        }
    }
}

impl FieldSource for EvaluationContext {
    fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    fn field_names(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }
}

impl From<Map<String, Value>> for EvaluationContext {
    fn from(data: Map<String, Value>) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> EvaluationContext {
        EvaluationContext::new(json!({
            "ram_gb": 16,
            "condition": "used",
            "cpu": {
                "name": "i7-8700",
                "cpu_mark_multi": 13000,
                "vendor": null
            },
            "gpus": [
                {"name": "GTX 1060"}
            ],
            "custom": {
                "warranty_months": 6
            }
        }))
    }

    #[test]
    fn test_resolve_nested_paths() {
        let ctx = sample();
        assert_eq!(ctx.get_field("ram_gb"), Some(&json!(16)));
        assert_eq!(ctx.get_field("cpu.cpu_mark_multi"), Some(&json!(13000)));
        assert_eq!(ctx.get_field("gpus.0.name"), Some(&json!("GTX 1060")));
        assert_eq!(ctx.get_field("custom.warranty_months"), Some(&json!(6)));
    }

    #[test]
    fn test_missing_or_null_intermediate_is_none() {
        let ctx = sample();
        assert_eq!(ctx.get_field("cpu.vendor"), None);
        assert_eq!(ctx.get_field("cpu.vendor.name"), None);
        assert_eq!(ctx.get_field("gpu.name"), None);
        assert_eq!(ctx.get_field("ram_gb.value"), None);
        assert_eq!(ctx.get_field("gpus.7.name"), None);
    }

    #[test]
    fn test_flattened_dotted_key_takes_precedence() {
        let ctx = EvaluationContext::default().with("cpu.cpu_mark_multi", 9000);
        assert_eq!(ctx.get_field("cpu.cpu_mark_multi"), Some(&json!(9000)));
    }

    #[test]
    fn test_non_object_context_is_empty() {
        let ctx = EvaluationContext::new(json!([1, 2, 3]));
        assert!(ctx.data().is_empty());
    }

    #[test]
    fn test_available_fields_lists_leaves() {
        let fields = sample().available_fields();
        assert!(fields.contains("ram_gb"));
        assert!(fields.contains("cpu.cpu_mark_multi"));
        assert!(fields.contains("custom.warranty_months"));
        assert!(!fields.contains("cpu"));
    }

    #[test]
    fn test_resolve_against_plain_map() {
        let mut map = HashMap::new();
        map.insert("storage".to_string(), json!({"type": "NVMe"}));
        assert_eq!(resolve(&map, "storage.type"), Some(&json!("NVMe")));
    }
}
