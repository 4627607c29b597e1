//! 内存目录：从 JSON 快照构建的结构化 + 相似度存储

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    best_symptom_match, contains_ci, part_document, part_matches_filters, part_matches_text,
    rank_similar, ApplianceModel, CatalogSnapshot, Part, PartQuery, RepairInstruction,
    SimilarityCollection, SimilarityStore, StoreError, StructuredStore, Symptom,
    DEFAULT_SIMILARITY_THRESHOLD,
};

const DEFAULT_SEARCH_LIMIT: usize = 20;

/// 内存目录；按配件号 / 型号建索引
pub struct MemoryCatalog {
    snapshot: CatalogSnapshot,
    parts_by_ps: HashMap<String, usize>,
    models_by_number: HashMap<String, usize>,
    threshold: f64,
}

impl MemoryCatalog {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        let parts_by_ps = snapshot
            .parts
            .iter()
            .enumerate()
            .map(|(i, p)| (p.ps_number.to_uppercase(), i))
            .collect();
        let models_by_number = snapshot
            .models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.model_number.to_uppercase(), i))
            .collect();
        Self {
            snapshot,
            parts_by_ps,
            models_by_number,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(CatalogSnapshot::load_json(path)?))
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn snapshot(&self) -> &CatalogSnapshot {
        &self.snapshot
    }

    fn part(&self, ps_number: &str) -> Option<&Part> {
        self.parts_by_ps
            .get(&ps_number.trim().to_uppercase())
            .map(|&i| &self.snapshot.parts[i])
    }

    fn model(&self, model_number: &str) -> Option<&ApplianceModel> {
        self.models_by_number
            .get(&model_number.trim().to_uppercase())
            .map(|&i| &self.snapshot.models[i])
    }

    fn is_linked(&self, ps_number: &str, model_number: &str) -> bool {
        self.snapshot.compatibility.iter().any(|l| {
            l.ps_number.eq_ignore_ascii_case(ps_number.trim())
                && l.model_number.eq_ignore_ascii_case(model_number.trim())
        })
    }
}

fn brand_matches(field: Option<&str>, wanted: Option<&str>) -> bool {
    match wanted {
        Some(w) => field.map(|f| f.eq_ignore_ascii_case(w)).unwrap_or(false),
        None => true,
    }
}

#[async_trait]
impl StructuredStore for MemoryCatalog {
    async fn get_part(&self, ps_number: &str) -> Result<Option<Part>, StoreError> {
        Ok(self.part(ps_number).cloned())
    }

    async fn find_by_manufacturer_number(&self, code: &str) -> Result<Option<Part>, StoreError> {
        let code = code.trim();
        Ok(self
            .snapshot
            .parts
            .iter()
            .find(|p| {
                p.manufacturer_part_number
                    .as_deref()
                    .map(|m| m.eq_ignore_ascii_case(code))
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn find_by_manufacturer_number_partial(
        &self,
        code: &str,
    ) -> Result<Vec<Part>, StoreError> {
        Ok(self
            .snapshot
            .parts
            .iter()
            .filter(|p| {
                p.manufacturer_part_number
                    .as_deref()
                    .map(|m| contains_ci(m, code.trim()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn get_model(&self, model_number: &str) -> Result<Option<ApplianceModel>, StoreError> {
        Ok(self.model(model_number).cloned())
    }

    async fn find_models_fuzzy(&self, input: &str) -> Result<Vec<ApplianceModel>, StoreError> {
        Ok(self
            .snapshot
            .models
            .iter()
            .filter(|m| contains_ci(&m.model_number, input.trim()))
            .cloned()
            .collect())
    }

    async fn search_parts(&self, query: &PartQuery) -> Result<Vec<Part>, StoreError> {
        let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        Ok(self
            .snapshot
            .parts
            .iter()
            .filter(|p| match query.query.as_deref() {
                Some(text) if !text.trim().is_empty() => part_matches_text(p, text),
                _ => true,
            })
            .filter(|p| part_matches_filters(p, query))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn check_compatibility(
        &self,
        ps_number: &str,
        model_number: &str,
    ) -> Result<Option<bool>, StoreError> {
        if self.part(ps_number).is_none() || self.model(model_number).is_none() {
            return Ok(None);
        }
        Ok(Some(self.is_linked(ps_number, model_number)))
    }

    async fn get_compatible_parts(
        &self,
        model_number: &str,
        part_type: Option<&str>,
        brand: Option<&str>,
    ) -> Result<Option<Vec<Part>>, StoreError> {
        if self.model(model_number).is_none() {
            return Ok(None);
        }
        let parts = self
            .snapshot
            .compatibility
            .iter()
            .filter(|l| l.model_number.eq_ignore_ascii_case(model_number.trim()))
            .filter_map(|l| self.part(&l.ps_number))
            .filter(|p| {
                part_type
                    .map(|t| p.part_type.as_deref().map(|pt| contains_ci(pt, t)).unwrap_or(false))
                    .unwrap_or(true)
            })
            .filter(|p| brand_matches(p.brand.as_deref(), brand))
            .cloned()
            .collect();
        Ok(Some(parts))
    }

    async fn get_compatible_models(
        &self,
        ps_number: &str,
        brand: Option<&str>,
    ) -> Result<Option<Vec<ApplianceModel>>, StoreError> {
        if self.part(ps_number).is_none() {
            return Ok(None);
        }
        let models = self
            .snapshot
            .compatibility
            .iter()
            .filter(|l| l.ps_number.eq_ignore_ascii_case(ps_number.trim()))
            .filter_map(|l| self.model(&l.model_number))
            .filter(|m| brand_matches(m.brand.as_deref(), brand))
            .cloned()
            .collect();
        Ok(Some(models))
    }

    async fn get_symptoms(
        &self,
        appliance_type: &str,
        symptom: Option<&str>,
    ) -> Result<Vec<Symptom>, StoreError> {
        let for_type: Vec<&Symptom> = self
            .snapshot
            .symptoms
            .iter()
            .filter(|s| s.appliance_type.eq_ignore_ascii_case(appliance_type.trim()))
            .collect();
        Ok(match symptom {
            Some(wanted) => best_symptom_match(for_type.iter().copied(), wanted, |s| s.symptom.as_str())
                .cloned()
                .into_iter()
                .collect(),
            None => for_type.into_iter().cloned().collect(),
        })
    }

    async fn get_repair_instructions(
        &self,
        appliance_type: &str,
        symptom: &str,
        part_type: Option<&str>,
    ) -> Result<Vec<RepairInstruction>, StoreError> {
        let for_type: Vec<&RepairInstruction> = self
            .snapshot
            .repair_instructions
            .iter()
            .filter(|r| r.appliance_type.eq_ignore_ascii_case(appliance_type.trim()))
            .collect();
        let Some(best) = best_symptom_match(for_type.iter().copied(), symptom, |r| r.symptom.as_str())
        else {
            return Ok(Vec::new());
        };
        let matched = best.symptom.clone();
        Ok(for_type
            .into_iter()
            .filter(|r| r.symptom == matched)
            .filter(|r| part_type.map(|t| contains_ci(&r.part_type, t)).unwrap_or(true))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SimilarityStore for MemoryCatalog {
    async fn search_similar(
        &self,
        collection: SimilarityCollection,
        query: &str,
        scope_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let in_scope = |ps: &str| scope_key.map(|k| ps.eq_ignore_ascii_case(k)).unwrap_or(true);
        let docs: Vec<(String, Value)> = match collection {
            SimilarityCollection::Parts => self
                .snapshot
                .parts
                .iter()
                .filter(|p| in_scope(&p.ps_number))
                .map(|p| (part_document(p), to_value(p)))
                .collect(),
            SimilarityCollection::Qna => self
                .snapshot
                .qna
                .iter()
                .filter(|q| in_scope(&q.ps_number))
                .map(|q| (format!("{} {}", q.question, q.answer), to_value(q)))
                .collect(),
            SimilarityCollection::RepairStories => self
                .snapshot
                .repair_stories
                .iter()
                .filter(|s| in_scope(&s.ps_number))
                .map(|s| (format!("{} {}", s.title, s.instruction), to_value(s)))
                .collect(),
            SimilarityCollection::Reviews => self
                .snapshot
                .reviews
                .iter()
                .filter(|r| in_scope(&r.ps_number))
                .map(|r| (format!("{} {}", r.title, r.review_text), to_value(r)))
                .collect(),
        };
        Ok(rank_similar(query, docs, self.threshold, limit))
    }
}

fn to_value<T: serde::Serialize>(record: &T) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::store::{CompatibilityLink, PartList, QnaEntry};

    /// 测试用小目录：两个冰箱件、一个洗碗机件、一个微波炉件
    pub fn sample_snapshot() -> CatalogSnapshot {
        let part = |ps: &str, name: &str, mpn: &str, appliance: &str, price: f64| Part {
            ps_number: ps.to_string(),
            part_name: name.to_string(),
            part_type: Some(name.to_string()),
            manufacturer_part_number: Some(mpn.to_string()),
            brand: Some("Whirlpool".to_string()),
            appliance_type: Some(appliance.to_string()),
            part_price: Some(price),
            availability: Some("In Stock".to_string()),
            product_url: Some(format!("https://www.partselect.com/{ps}.htm")),
            ..Default::default()
        };
        CatalogSnapshot {
            parts: vec![
                part("PS11752778", "Refrigerator Door Shelf Bin", "WPW10321304", "refrigerator", 44.95),
                part("PS11739119", "Ice Maker Assembly", "W10190965", "refrigerator", 129.99),
                part("PS10065979", "Dishwasher Upper Rack Adjuster Kit", "W10350376", "dishwasher", 37.77),
                part("PS99999999", "Microwave Turntable Tray", "WB49X10099", "microwave", 59.00),
            ],
            models: vec![
                ApplianceModel {
                    model_number: "WDT780SAEM1".to_string(),
                    brand: Some("Whirlpool".to_string()),
                    description: Some("Whirlpool Dishwasher".to_string()),
                    appliance_type: Some("dishwasher".to_string()),
                },
                ApplianceModel {
                    model_number: "WRS325SDHZ01".to_string(),
                    brand: Some("Whirlpool".to_string()),
                    description: Some("Whirlpool Side-by-Side Refrigerator".to_string()),
                    appliance_type: Some("refrigerator".to_string()),
                },
                ApplianceModel {
                    model_number: "WRS325SDHZ02".to_string(),
                    brand: Some("Whirlpool".to_string()),
                    description: Some("Whirlpool Side-by-Side Refrigerator".to_string()),
                    appliance_type: Some("refrigerator".to_string()),
                },
            ],
            compatibility: vec![
                CompatibilityLink {
                    ps_number: "PS10065979".to_string(),
                    model_number: "WDT780SAEM1".to_string(),
                },
                CompatibilityLink {
                    ps_number: "PS11752778".to_string(),
                    model_number: "WRS325SDHZ01".to_string(),
                },
            ],
            symptoms: vec![Symptom {
                appliance_type: "dishwasher".to_string(),
                symptom: "Not draining".to_string(),
                percentage: Some(27.0),
                parts: PartList(vec!["Drain Pump".to_string(), "Check Valve".to_string()]),
                ..Default::default()
            }],
            repair_instructions: vec![RepairInstruction {
                appliance_type: "dishwasher".to_string(),
                symptom: "Not draining".to_string(),
                part_type: "Drain Pump".to_string(),
                instructions: "Disconnect power, remove the lower panel, test the pump.".to_string(),
                ..Default::default()
            }],
            qna: vec![QnaEntry {
                ps_number: "PS11752778".to_string(),
                question: "Does this bin fit the door of a side by side fridge?".to_string(),
                answer: "Yes, it fits most Whirlpool side by side doors.".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::sample_snapshot;
    use super::*;

    #[tokio::test]
    async fn test_lookup_distinguishes_missing() {
        let catalog = MemoryCatalog::new(sample_snapshot());
        assert!(catalog.get_part("ps11752778").await.unwrap().is_some());
        assert!(catalog.get_part("PS1").await.unwrap().is_none());
        assert_eq!(
            catalog.check_compatibility("PS11752778", "WRS325SDHZ01").await.unwrap(),
            Some(true)
        );
        assert_eq!(
            catalog.check_compatibility("PS11752778", "WDT780SAEM1").await.unwrap(),
            Some(false)
        );
        assert_eq!(catalog.check_compatibility("PS1", "WDT780SAEM1").await.unwrap(), None);
        assert!(catalog.get_compatible_models("PS1", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manufacturer_and_fuzzy_model() {
        let catalog = MemoryCatalog::new(sample_snapshot());
        let p = catalog.find_by_manufacturer_number("wpw10321304").await.unwrap();
        assert_eq!(p.unwrap().ps_number, "PS11752778");
        let partial = catalog.find_by_manufacturer_number_partial("W103").await.unwrap();
        assert_eq!(partial.len(), 2);
        assert_eq!(catalog.find_models_fuzzy("WRS325").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_search_and_similarity() {
        let catalog = MemoryCatalog::new(sample_snapshot());
        let q = PartQuery {
            query: Some("ice maker".into()),
            ..Default::default()
        };
        let hits = catalog.search_parts(&q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ps_number, "PS11739119");

        let filtered = PartQuery {
            appliance_type: Some("dishwasher".into()),
            max_price: Some(40.0),
            ..Default::default()
        };
        assert_eq!(catalog.search_parts(&filtered).await.unwrap().len(), 1);

        let qna = catalog
            .search_similar(SimilarityCollection::Qna, "fit side by side door", Some("PS11752778"), 3)
            .await
            .unwrap();
        assert_eq!(qna.len(), 1);
        let none = catalog
            .search_similar(SimilarityCollection::Reviews, "anything", None, 3)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_symptoms_and_instructions() {
        let catalog = MemoryCatalog::new(sample_snapshot());
        let s = catalog.get_symptoms("dishwasher", Some("won't drain, not draining")).await.unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].parts.0.len(), 2);
        let r = catalog
            .get_repair_instructions("dishwasher", "not draining", Some("pump"))
            .await
            .unwrap();
        assert_eq!(r.len(), 1);
        assert!(catalog
            .get_repair_instructions("refrigerator", "not draining", None)
            .await
            .unwrap()
            .is_empty());
    }
}
