//! 目录数据类型：配件、家电型号、故障症状、维修说明与用户内容（问答 / 维修故事 / 评价）

use std::path::Path;

use serde::{Deserialize, Serialize};

/// 配件记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Part {
    pub ps_number: String,
    pub part_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer_part_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    /// 家电类别；缺失时由数据门控推断
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appliance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_difficulty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_reviews: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_url: Option<String>,
}

impl Part {
    pub fn in_stock(&self) -> bool {
        self.availability
            .as_deref()
            .map(|a| a.to_lowercase().contains("in stock"))
            .unwrap_or(false)
    }
}

/// 家电型号
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplianceModel {
    pub model_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appliance_type: Option<String>,
}

/// 配件与型号的适配关系
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityLink {
    pub ps_number: String,
    pub model_number: String,
}

/// 「需要检查的配件」列表：上游可能给逗号分隔字符串，也可能给数组，两种都接受
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawPartList")]
pub struct PartList(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPartList {
    Text(String),
    List(Vec<String>),
}

impl From<RawPartList> for PartList {
    fn from(raw: RawPartList) -> Self {
        let items = match raw {
            RawPartList::Text(s) => s.split(',').map(str::to_string).collect(),
            RawPartList::List(v) => v,
        };
        PartList(
            items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }
}

/// 故障症状
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Symptom {
    pub appliance_type: String,
    pub symptom: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 该症状在报修中的占比
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    pub parts: PartList,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptom_url: Option<String>,
}

/// 针对某症状、某配件类型的排查步骤
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairInstruction {
    pub appliance_type: String,
    pub symptom: String,
    pub part_type: String,
    pub instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptom_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QnaEntry {
    pub ps_number: String,
    pub question: String,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairStory {
    pub ps_number: String,
    pub title: String,
    pub instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helpful_votes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Review {
    pub ps_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    pub title: String,
    pub review_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// 实时抓取结果：配件本身 + 嵌套子集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivePart {
    #[serde(flatten)]
    pub part: Part,
    pub compatible_models: Vec<ApplianceModel>,
    pub qna: Vec<QnaEntry>,
    pub repair_stories: Vec<RepairStory>,
    pub reviews: Vec<Review>,
}

/// 配件文本搜索条件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartQuery {
    pub query: Option<String>,
    pub appliance_type: Option<String>,
    pub part_type: Option<String>,
    pub brand: Option<String>,
    pub max_price: Option<f64>,
    pub in_stock_only: bool,
    pub limit: Option<usize>,
}

/// 相似度检索的集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityCollection {
    Parts,
    Qna,
    RepairStories,
    Reviews,
}

/// 完整目录快照（JSON 文件格式，也用作 SQLite 导入源）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSnapshot {
    pub parts: Vec<Part>,
    pub models: Vec<ApplianceModel>,
    pub compatibility: Vec<CompatibilityLink>,
    pub symptoms: Vec<Symptom>,
    pub repair_instructions: Vec<RepairInstruction>,
    pub qna: Vec<QnaEntry>,
    pub repair_stories: Vec<RepairStory>,
    pub reviews: Vec<Review>,
}

impl CatalogSnapshot {
    pub fn load_json(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_list_accepts_string_or_list() {
        let from_text: Symptom =
            serde_json::from_str(r#"{"symptom": "Leaking", "parts": "Door Gasket, Pump,, Valve "}"#)
                .unwrap();
        assert_eq!(from_text.parts.0, vec!["Door Gasket", "Pump", "Valve"]);

        let from_list: Symptom =
            serde_json::from_str(r#"{"symptom": "Leaking", "parts": ["Door Gasket"]}"#).unwrap();
        assert_eq!(from_list.parts.0, vec!["Door Gasket"]);

        let missing: Symptom = serde_json::from_str(r#"{"symptom": "Noisy"}"#).unwrap();
        assert!(missing.parts.0.is_empty());
    }

    #[test]
    fn test_live_part_flattens_part_fields() {
        let live: LivePart = serde_json::from_value(serde_json::json!({
            "ps_number": "PS11752778",
            "part_name": "Refrigerator Door Shelf Bin",
            "reviews": [{"ps_number": "PS11752778", "title": "Fit", "review_text": "Snapped in"}]
        }))
        .unwrap();
        assert_eq!(live.part.ps_number, "PS11752778");
        assert_eq!(live.reviews.len(), 1);

        let value = serde_json::to_value(&live).unwrap();
        assert_eq!(value["part_name"], "Refrigerator Door Shelf Bin");
        assert!(value["compatible_models"].as_array().unwrap().is_empty());
    }
}
