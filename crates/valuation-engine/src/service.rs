//! 估值服务
//!
//! 引擎核心之外的异步外壳：通过仓储读取商品与规则集，调用多层评估器，
//! 并在 `apply` 时把结果写回商品。除写回之外的计算都是纯函数。

use crate::context::EvaluationContext;
use crate::error::{Result, RuleError};
use crate::layered::LayeredEvaluator;
use crate::models::Ruleset;
use crate::results::EvaluationResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument};

/// 估值所需的商品信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: i64,
    pub base_price: f64,
    /// 调用方组装好的字段上下文
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// 商品指定的规则集，存在时走单规则集模式
    #[serde(default)]
    pub ruleset_id: Option<i64>,
    #[serde(default)]
    pub excluded_ruleset_ids: Vec<i64>,
    #[serde(default)]
    pub adjusted_price: Option<f64>,
    #[serde(default)]
    pub valuation_breakdown: Option<Value>,
}

impl ItemRecord {
    pub fn new(id: i64, base_price: f64, attributes: Value) -> Self {
        Self {
            id,
            base_price,
            attributes: match attributes {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            ruleset_id: None,
            excluded_ruleset_ids: Vec::new(),
            adjusted_price: None,
            valuation_breakdown: None,
        }
    }

    pub fn context(&self) -> EvaluationContext {
        EvaluationContext::from(self.attributes.clone())
    }
}

/// 规则集仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RulesetRepository: Send + Sync {
    async fn get_ruleset(&self, id: i64) -> Result<Option<Ruleset>>;
    async fn list_active_rulesets(&self) -> Result<Vec<Ruleset>>;
}

/// 商品仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn get_item(&self, id: i64) -> Result<Option<ItemRecord>>;
    async fn save_valuation(&self, item_id: i64, adjusted_price: f64, breakdown: Value) -> Result<()>;
}

/// 内存商品仓储
#[derive(Debug, Default)]
pub struct InMemoryItemRepository {
    items: DashMap<i64, ItemRecord>,
}

impl InMemoryItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item: ItemRecord) {
        self.items.insert(item.id, item);
    }

    pub fn get(&self, id: i64) -> Option<ItemRecord> {
        self.items.get(&id).map(|item| item.clone())
    }
}

#[async_trait]
impl ItemRepository for InMemoryItemRepository {
    async fn get_item(&self, id: i64) -> Result<Option<ItemRecord>> {
        Ok(self.get(id))
    }

    async fn save_valuation(&self, item_id: i64, adjusted_price: f64, breakdown: Value) -> Result<()> {
        let mut item = self
            .items
            .get_mut(&item_id)
            .ok_or(RuleError::ItemNotFound(item_id))?;
        item.adjusted_price = Some(adjusted_price);
        item.valuation_breakdown = Some(breakdown);
        Ok(())
    }
}

/// 估值服务
///
/// 同一商品的并发 `apply` 由调用方负责串行化，服务本身不加锁。
pub struct ValuationService<RR, IR>
where
    RR: RulesetRepository,
    IR: ItemRepository,
{
    rulesets: Arc<RR>,
    items: Arc<IR>,
    evaluator: LayeredEvaluator,
}

impl<RR, IR> ValuationService<RR, IR>
where
    RR: RulesetRepository,
    IR: ItemRepository,
{
    pub fn new(rulesets: Arc<RR>, items: Arc<IR>, evaluator: LayeredEvaluator) -> Self {
        Self {
            rulesets,
            items,
            evaluator,
        }
    }

    pub fn evaluator(&self) -> &LayeredEvaluator {
        &self.evaluator
    }

    /// 评估商品
    ///
    /// 指定了规则集（参数或商品自身）时只评估该规则集；
    /// 否则在所有启用的规则集上做多层评估，排除列表与商品自身的排除项合并。
    #[instrument(skip(self))]
    pub async fn evaluate_item(
        &self,
        item_id: i64,
        exclude_ids: &[i64],
        explicit_ruleset_id: Option<i64>,
    ) -> Result<EvaluationResult> {
        let item = self
            .items
            .get_item(item_id)
            .await?
            .ok_or(RuleError::ItemNotFound(item_id))?;
        let context = item.context();

        let mut result = match explicit_ruleset_id.or(item.ruleset_id) {
            Some(ruleset_id) => {
                let ruleset = self
                    .rulesets
                    .get_ruleset(ruleset_id)
                    .await?
                    .ok_or(RuleError::RulesetNotFound(ruleset_id))?;
                self.evaluator
                    .evaluate_single(&ruleset, item.base_price, &context)
            }
            None => {
                let rulesets = self.rulesets.list_active_rulesets().await?;
                let mut excluded = exclude_ids.to_vec();
                excluded.extend(item.excluded_ruleset_ids.iter().copied());
                self.evaluator
                    .evaluate(&rulesets, &excluded, item.base_price, &context)
            }
        };

        result.item_id = Some(item.id);
        Ok(result)
    }

    /// 评估并写回商品的调整后价格与估值明细
    #[instrument(skip(self))]
    pub async fn apply(&self, item_id: i64) -> Result<EvaluationResult> {
        let result = self.evaluate_item(item_id, &[], None).await?;

        self.items
            .save_valuation(item_id, result.adjusted_price, result.breakdown_json())
            .await?;

        info!(
            item_id,
            adjusted_price = result.adjusted_price,
            "估值已写回"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::models::{Rule, RuleGroup};
    use mockall::predicate::eq;
    use serde_json::json;

    fn ruleset(id: i64, priority: i32, value: f64) -> Ruleset {
        Ruleset::new(format!("rs-{}", id), priority).with_id(id).with_group(
            RuleGroup::new("g", "misc").with_rule(Rule::new("r").with_id(id).with_action(Action::fixed(value))),
        )
    }

    fn item() -> ItemRecord {
        ItemRecord::new(7, 1000.0, json!({"ram_gb": 16}))
    }

    #[tokio::test]
    async fn test_evaluate_item_multi_layer() {
        let mut rulesets = MockRulesetRepository::new();
        rulesets
            .expect_list_active_rulesets()
            .returning(|| Ok(vec![ruleset(1, 1, 50.0), ruleset(2, 8, 25.0)]));
        let mut items = MockItemRepository::new();
        items
            .expect_get_item()
            .with(eq(7))
            .returning(|_| Ok(Some(item())));

        let service = ValuationService::new(Arc::new(rulesets), Arc::new(items), LayeredEvaluator::default());
        let result = service.evaluate_item(7, &[], None).await.unwrap();

        assert_eq!(result.adjusted_price, 1075.0);
        assert_eq!(result.item_id, Some(7));
    }

    #[tokio::test]
    async fn test_item_exclusions_are_merged() {
        let mut rulesets = MockRulesetRepository::new();
        rulesets
            .expect_list_active_rulesets()
            .returning(|| Ok(vec![ruleset(1, 1, 50.0), ruleset(2, 8, 25.0), ruleset(3, 20, 5.0)]));
        let mut items = MockItemRepository::new();
        items.expect_get_item().returning(|_| {
            let mut item = item();
            item.excluded_ruleset_ids = vec![2];
            Ok(Some(item))
        });

        let service = ValuationService::new(Arc::new(rulesets), Arc::new(items), LayeredEvaluator::default());
        let result = service.evaluate_item(7, &[3], None).await.unwrap();
        assert_eq!(result.total_adjustment, 50.0);
    }

    #[tokio::test]
    async fn test_assigned_ruleset_uses_single_mode() {
        let mut rulesets = MockRulesetRepository::new();
        rulesets
            .expect_get_ruleset()
            .with(eq(2))
            .returning(|id| Ok(Some(ruleset(id, 8, 25.0))));
        rulesets.expect_list_active_rulesets().never();
        let mut items = MockItemRepository::new();
        items.expect_get_item().returning(|_| {
            let mut item = item();
            item.ruleset_id = Some(2);
            Ok(Some(item))
        });

        let service = ValuationService::new(Arc::new(rulesets), Arc::new(items), LayeredEvaluator::default());
        let result = service.evaluate_item(7, &[], None).await.unwrap();
        assert_eq!(result.total_adjustment, 25.0);
    }

    #[tokio::test]
    async fn test_missing_item_and_ruleset() {
        let mut rulesets = MockRulesetRepository::new();
        rulesets.expect_get_ruleset().returning(|_| Ok(None));
        let mut items = MockItemRepository::new();
        items
            .expect_get_item()
            .returning(|id| Ok(if id == 7 { Some(item()) } else { None }));

        let service = ValuationService::new(Arc::new(rulesets), Arc::new(items), LayeredEvaluator::default());

        let err = service.evaluate_item(99, &[], None).await.unwrap_err();
        assert_eq!(err.code(), "ITEM_NOT_FOUND");

        let err = service.evaluate_item(7, &[], Some(42)).await.unwrap_err();
        assert_eq!(err.code(), "RULESET_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_apply_writes_back() {
        let mut rulesets = MockRulesetRepository::new();
        rulesets
            .expect_list_active_rulesets()
            .returning(|| Ok(vec![ruleset(1, 1, 50.0)]));
        let mut items = MockItemRepository::new();
        items.expect_get_item().returning(|_| Ok(Some(item())));
        items
            .expect_save_valuation()
            .withf(|id, price, breakdown| *id == 7 && *price == 1050.0 && breakdown["total_adjustment"] == 50.0)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = ValuationService::new(Arc::new(rulesets), Arc::new(items), LayeredEvaluator::default());
        let result = service.apply(7).await.unwrap();
        assert_eq!(result.adjusted_price, 1050.0);
    }

    #[tokio::test]
    async fn test_in_memory_item_repository() {
        let repo = InMemoryItemRepository::new();
        repo.insert(item());

        repo.save_valuation(7, 1.0, json!({"ok": true})).await.unwrap();
        assert_eq!(repo.get(7).unwrap().adjusted_price, Some(1.0));
        assert!(repo.save_valuation(8, 1.0, Value::Null).await.is_err());
    }
}
