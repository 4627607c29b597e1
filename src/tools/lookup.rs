//! lookup 类操作：按配件号 / 型号精确查找与关系判断
//!
//! 「无此实体」一律返回 NotFound；带配件号参数的操作声明 identifier_arg，供回退编排器触发实时抓取。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::OpError;
use crate::session::EntityKey;
use crate::store::{ApplianceModel, StructuredStore};
use crate::tools::{Operation, OperationCategory, OperationContext};

pub(crate) fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, OpError> {
    optional_str(args, name).ok_or_else(|| OpError::invalid_input(format!("missing argument: {}", name)))
}

pub(crate) fn optional_str<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// 配件号参数：格式错误为 InvalidInput（不会触发回退）
pub(crate) fn part_key(args: &Value, name: &str) -> Result<EntityKey, OpError> {
    let raw = required_str(args, name)?;
    EntityKey::parse(raw).ok_or_else(|| OpError::invalid_input(format!("not a PS part number: {}", raw)))
}

fn to_payload<T: serde::Serialize>(value: &T) -> Result<Value, OpError> {
    serde_json::to_value(value).map_err(|e| OpError::invalid_input(e.to_string()))
}

fn models_payload(ps_number: &str, models: &[ApplianceModel]) -> Value {
    json!({
        "part_number": ps_number,
        "compatible_model_count": models.len(),
        "models": models,
    })
}

fn live_models(live: &Value) -> Vec<ApplianceModel> {
    live.get("compatible_models")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub struct GetPartOp {
    store: Arc<dyn StructuredStore>,
}

impl GetPartOp {
    pub fn new(store: Arc<dyn StructuredStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Operation for GetPartOp {
    fn name(&self) -> &str {
        "get_part"
    }

    fn description(&self) -> &str {
        "Full record for one part: name, price, stock, brand, appliance type, install difficulty, rating."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Lookup
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "ps_number": { "type": "string" } },
            "required": ["ps_number"]
        })
    }

    fn identifier_arg(&self) -> Option<&str> {
        Some("ps_number")
    }

    fn answer_from_live(&self, live: &Value, _args: &Value) -> Option<Value> {
        Some(live.clone())
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let key = part_key(&args, "ps_number")?;
        // 非冰箱 / 洗碗机配件照常返回，由数据门控拦截
        match self.store.get_part(key.as_str()).await? {
            Some(part) => to_payload(&part),
            None => Err(OpError::not_found(format!("part {} is not in the catalog", key))),
        }
    }
}

pub struct CheckCompatibilityOp {
    store: Arc<dyn StructuredStore>,
}

impl CheckCompatibilityOp {
    pub fn new(store: Arc<dyn StructuredStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Operation for CheckCompatibilityOp {
    fn name(&self) -> &str {
        "check_compatibility"
    }

    fn description(&self) -> &str {
        "Whether a part fits a specific appliance model."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Lookup
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ps_number": { "type": "string" },
                "model_number": { "type": "string" }
            },
            "required": ["ps_number", "model_number"]
        })
    }

    fn identifier_arg(&self) -> Option<&str> {
        Some("ps_number")
    }

    fn answer_from_live(&self, live: &Value, args: &Value) -> Option<Value> {
        let model = optional_str(args, "model_number")?;
        let compatible = live_models(live)
            .iter()
            .any(|m| m.model_number.eq_ignore_ascii_case(model));
        Some(json!({
            "ps_number": live.get("ps_number").cloned().unwrap_or(Value::Null),
            "model_number": model.to_uppercase(),
            "compatible": compatible,
        }))
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let key = part_key(&args, "ps_number")?;
        let model = required_str(&args, "model_number")?.to_uppercase();
        match self.store.check_compatibility(key.as_str(), &model).await? {
            Some(compatible) => Ok(json!({
                "ps_number": key.as_str(),
                "model_number": model,
                "compatible": compatible,
            })),
            // 配件在目录中时缺的只能是型号，这种 NotFound 不触发实时抓取
            None => match self.store.get_part(key.as_str()).await? {
                Some(_) => Err(OpError::not_found_arg(
                    "model_number",
                    &model,
                    format!("model {} is not in the catalog", model),
                )),
                None => Err(OpError::not_found(format!("part {} is not in the catalog", key))),
            },
        }
    }
}

pub struct GetCompatiblePartsOp {
    store: Arc<dyn StructuredStore>,
}

impl GetCompatiblePartsOp {
    pub fn new(store: Arc<dyn StructuredStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Operation for GetCompatiblePartsOp {
    fn name(&self) -> &str {
        "get_compatible_parts"
    }

    fn description(&self) -> &str {
        "Parts that fit a model, optionally filtered by part type or brand."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Lookup
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "model_number": { "type": "string" },
                "part_type": { "type": "string" },
                "brand": { "type": "string" }
            },
            "required": ["model_number"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let model = required_str(&args, "model_number")?;
        let parts = self
            .store
            .get_compatible_parts(model, optional_str(&args, "part_type"), optional_str(&args, "brand"))
            .await?
            .ok_or_else(|| OpError::not_found(format!("model {} is not in the catalog", model)))?;
        to_payload(&parts)
    }
}

pub struct GetCompatibleModelsOp {
    store: Arc<dyn StructuredStore>,
}

impl GetCompatibleModelsOp {
    pub fn new(store: Arc<dyn StructuredStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Operation for GetCompatibleModelsOp {
    fn name(&self) -> &str {
        "get_compatible_models"
    }

    fn description(&self) -> &str {
        "Appliance models a part fits, optionally filtered by brand."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Lookup
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ps_number": { "type": "string" },
                "brand": { "type": "string" }
            },
            "required": ["ps_number"]
        })
    }

    fn identifier_arg(&self) -> Option<&str> {
        Some("ps_number")
    }

    fn answer_from_live(&self, live: &Value, args: &Value) -> Option<Value> {
        let ps_number = live.get("ps_number").and_then(Value::as_str)?;
        let brand = optional_str(args, "brand");
        let models: Vec<ApplianceModel> = live_models(live)
            .into_iter()
            .filter(|m| match brand {
                Some(b) => m.brand.as_deref().map(|mb| mb.eq_ignore_ascii_case(b)).unwrap_or(false),
                None => true,
            })
            .collect();
        Some(models_payload(ps_number, &models))
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let key = part_key(&args, "ps_number")?;
        let models = self
            .store
            .get_compatible_models(key.as_str(), optional_str(&args, "brand"))
            .await?
            .ok_or_else(|| OpError::not_found(format!("part {} is not in the catalog", key)))?;
        Ok(models_payload(key.as_str(), &models))
    }
}

pub struct GetSymptomsOp {
    store: Arc<dyn StructuredStore>,
}

impl GetSymptomsOp {
    pub fn new(store: Arc<dyn StructuredStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Operation for GetSymptomsOp {
    fn name(&self) -> &str {
        "get_symptoms"
    }

    fn description(&self) -> &str {
        "Common symptoms for an appliance type with how often they occur, parts to check, and repair guide links. Pass a symptom to get the single best match."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Lookup
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "appliance_type": { "type": "string", "enum": ["refrigerator", "dishwasher"] },
                "symptom": { "type": "string" }
            },
            "required": ["appliance_type"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let appliance = required_str(&args, "appliance_type")?;
        let symptom = optional_str(&args, "symptom");
        let symptoms = self.store.get_symptoms(appliance, symptom).await?;
        if symptoms.is_empty() {
            return Err(OpError::not_found(match symptom {
                Some(s) => format!("no {} symptom matches \"{}\"", appliance, s),
                None => format!("no symptoms recorded for {}", appliance),
            }));
        }
        to_payload(&symptoms)
    }
}

pub struct GetRepairInstructionsOp {
    store: Arc<dyn StructuredStore>,
}

impl GetRepairInstructionsOp {
    pub fn new(store: Arc<dyn StructuredStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Operation for GetRepairInstructionsOp {
    fn name(&self) -> &str {
        "get_repair_instructions"
    }

    fn description(&self) -> &str {
        "Step-by-step checks for a symptom, per part type."
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Lookup
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "appliance_type": { "type": "string", "enum": ["refrigerator", "dishwasher"] },
                "symptom": { "type": "string" },
                "part_type": { "type": "string" }
            },
            "required": ["appliance_type", "symptom"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &OperationContext<'_>) -> Result<Value, OpError> {
        let appliance = required_str(&args, "appliance_type")?;
        let symptom = required_str(&args, "symptom")?;
        let steps = self
            .store
            .get_repair_instructions(appliance, symptom, optional_str(&args, "part_type"))
            .await?;
        if steps.is_empty() {
            return Err(OpError::not_found(format!(
                "no repair instructions for {} \"{}\"",
                appliance, symptom
            )));
        }
        to_payload(&steps)
    }
}
