//! SQLite 目录：rusqlite 同步访问，每次查询在 spawn_blocking 中打开连接
//!
//! 每张表保存完整记录的 JSON（data 列）以及用于检索的键列；文本匹配与相似度打分与 MemoryCatalog 共用。

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{
    best_symptom_match, contains_ci, part_document, part_matches_filters, part_matches_text,
    rank_similar, ApplianceModel, CatalogSnapshot, Part, PartQuery, QnaEntry, RepairInstruction,
    RepairStory, Review, SimilarityCollection, SimilarityStore, StoreError, StructuredStore,
    Symptom, DEFAULT_SIMILARITY_THRESHOLD,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS parts (
    ps_number TEXT PRIMARY KEY,
    manufacturer_part_number TEXT,
    appliance_type TEXT,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_parts_mpn ON parts(manufacturer_part_number);

CREATE TABLE IF NOT EXISTS models (
    model_number TEXT PRIMARY KEY,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS compatibility (
    ps_number TEXT NOT NULL,
    model_number TEXT NOT NULL,
    PRIMARY KEY (ps_number, model_number)
);

CREATE TABLE IF NOT EXISTS symptoms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    appliance_type TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repair_instructions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    appliance_type TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS qna (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ps_number TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repair_stories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ps_number TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reviews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ps_number TEXT NOT NULL,
    data TEXT NOT NULL
);
";

/// SQLite 目录
pub struct SqliteCatalog {
    db_path: PathBuf,
    threshold: f64,
}

impl SqliteCatalog {
    /// 打开（必要时创建）数据库并确保表结构存在
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }
        let catalog = Self {
            db_path: db_path.to_path_buf(),
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        };
        catalog
            .connect()?
            .execute_batch(SCHEMA)
            .map_err(query_error)?;
        Ok(catalog)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        open_connection(&self.db_path)
    }

    /// 导入快照（INSERT OR REPLACE），返回写入的配件数
    pub async fn import(&self, snapshot: CatalogSnapshot) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for p in &snapshot.parts {
                tx.execute(
                    "INSERT OR REPLACE INTO parts (ps_number, manufacturer_part_number, appliance_type, data)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        p.ps_number.to_uppercase(),
                        p.manufacturer_part_number.as_deref().map(str::to_uppercase),
                        p.appliance_type,
                        encode(p)?
                    ],
                )?;
            }
            for m in &snapshot.models {
                tx.execute(
                    "INSERT OR REPLACE INTO models (model_number, data) VALUES (?1, ?2)",
                    params![m.model_number.to_uppercase(), encode(m)?],
                )?;
            }
            for l in &snapshot.compatibility {
                tx.execute(
                    "INSERT OR IGNORE INTO compatibility (ps_number, model_number) VALUES (?1, ?2)",
                    params![l.ps_number.to_uppercase(), l.model_number.to_uppercase()],
                )?;
            }
            for s in &snapshot.symptoms {
                tx.execute(
                    "INSERT INTO symptoms (appliance_type, data) VALUES (?1, ?2)",
                    params![s.appliance_type.to_lowercase(), encode(s)?],
                )?;
            }
            for r in &snapshot.repair_instructions {
                tx.execute(
                    "INSERT INTO repair_instructions (appliance_type, data) VALUES (?1, ?2)",
                    params![r.appliance_type.to_lowercase(), encode(r)?],
                )?;
            }
            for q in &snapshot.qna {
                tx.execute(
                    "INSERT INTO qna (ps_number, data) VALUES (?1, ?2)",
                    params![q.ps_number.to_uppercase(), encode(q)?],
                )?;
            }
            for s in &snapshot.repair_stories {
                tx.execute(
                    "INSERT INTO repair_stories (ps_number, data) VALUES (?1, ?2)",
                    params![s.ps_number.to_uppercase(), encode(s)?],
                )?;
            }
            for r in &snapshot.reviews {
                tx.execute(
                    "INSERT INTO reviews (ps_number, data) VALUES (?1, ?2)",
                    params![r.ps_number.to_uppercase(), encode(r)?],
                )?;
            }
            tx.commit()?;
            Ok(snapshot.parts.len())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            f(&conn).map_err(query_error)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite task: {}", e)))?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    Connection::open(path)
        .map_err(|e| StoreError::Unavailable(format!("sqlite open {}: {}", path.display(), e)))
}

fn query_error(e: rusqlite::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn encode<T: Serialize>(record: &T) -> rusqlite::Result<String> {
    serde_json::to_string(record).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn decode<T: DeserializeOwned>(data: String) -> rusqlite::Result<T> {
    serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn query_one<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    arg: &str,
) -> rusqlite::Result<Option<T>> {
    conn.query_row(sql, params![arg], |row| row.get::<_, String>(0))
        .optional()?
        .map(decode)
        .transpose()
}

fn query_all<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for data in rows {
        out.push(decode(data?)?);
    }
    Ok(out)
}

fn exists(conn: &Connection, sql: &str, arg: &str) -> rusqlite::Result<bool> {
    Ok(conn
        .query_row(sql, params![arg], |_| Ok(()))
        .optional()?
        .is_some())
}

const PART_BY_PS: &str = "SELECT data FROM parts WHERE ps_number = ?1";
const MODEL_BY_NUMBER: &str = "SELECT data FROM models WHERE model_number = ?1";

#[async_trait]
impl StructuredStore for SqliteCatalog {
    async fn get_part(&self, ps_number: &str) -> Result<Option<Part>, StoreError> {
        let ps = ps_number.trim().to_uppercase();
        self.with_conn(move |conn| query_one(conn, PART_BY_PS, &ps)).await
    }

    async fn find_by_manufacturer_number(&self, code: &str) -> Result<Option<Part>, StoreError> {
        let code = code.trim().to_uppercase();
        self.with_conn(move |conn| {
            query_one(
                conn,
                "SELECT data FROM parts WHERE manufacturer_part_number = ?1 LIMIT 1",
                &code,
            )
        })
        .await
    }

    async fn find_by_manufacturer_number_partial(
        &self,
        code: &str,
    ) -> Result<Vec<Part>, StoreError> {
        let code = code.trim().to_uppercase();
        self.with_conn(move |conn| {
            query_all(
                conn,
                "SELECT data FROM parts WHERE manufacturer_part_number LIKE '%' || ?1 || '%'",
                params![code],
            )
        })
        .await
    }

    async fn get_model(&self, model_number: &str) -> Result<Option<ApplianceModel>, StoreError> {
        let model = model_number.trim().to_uppercase();
        self.with_conn(move |conn| query_one(conn, MODEL_BY_NUMBER, &model)).await
    }

    async fn find_models_fuzzy(&self, input: &str) -> Result<Vec<ApplianceModel>, StoreError> {
        let input = input.trim().to_uppercase();
        self.with_conn(move |conn| {
            query_all(
                conn,
                "SELECT data FROM models WHERE model_number LIKE '%' || ?1 || '%'",
                params![input],
            )
        })
        .await
    }

    async fn search_parts(&self, query: &PartQuery) -> Result<Vec<Part>, StoreError> {
        let query = query.clone();
        let limit = query.limit.unwrap_or(20);
        let all: Vec<Part> = self
            .with_conn(|conn| query_all(conn, "SELECT data FROM parts ORDER BY ps_number", params![]))
            .await?;
        Ok(all
            .into_iter()
            .filter(|p| match query.query.as_deref() {
                Some(text) if !text.trim().is_empty() => part_matches_text(p, text),
                _ => true,
            })
            .filter(|p| part_matches_filters(p, &query))
            .take(limit)
            .collect())
    }

    async fn check_compatibility(
        &self,
        ps_number: &str,
        model_number: &str,
    ) -> Result<Option<bool>, StoreError> {
        let ps = ps_number.trim().to_uppercase();
        let model = model_number.trim().to_uppercase();
        self.with_conn(move |conn| {
            if !exists(conn, "SELECT 1 FROM parts WHERE ps_number = ?1", &ps)?
                || !exists(conn, "SELECT 1 FROM models WHERE model_number = ?1", &model)?
            {
                return Ok(None);
            }
            let linked = conn
                .query_row(
                    "SELECT 1 FROM compatibility WHERE ps_number = ?1 AND model_number = ?2",
                    params![ps, model],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            Ok(Some(linked))
        })
        .await
    }

    async fn get_compatible_parts(
        &self,
        model_number: &str,
        part_type: Option<&str>,
        brand: Option<&str>,
    ) -> Result<Option<Vec<Part>>, StoreError> {
        let model = model_number.trim().to_uppercase();
        let parts: Option<Vec<Part>> = self
            .with_conn(move |conn| {
                if !exists(conn, "SELECT 1 FROM models WHERE model_number = ?1", &model)? {
                    return Ok(None);
                }
                query_all(
                    conn,
                    "SELECT p.data FROM compatibility c JOIN parts p ON p.ps_number = c.ps_number
                     WHERE c.model_number = ?1 ORDER BY p.ps_number",
                    params![model],
                )
                .map(Some)
            })
            .await?;
        Ok(parts.map(|parts| {
            parts
                .into_iter()
                .filter(|p| {
                    part_type
                        .map(|t| p.part_type.as_deref().map(|pt| contains_ci(pt, t)).unwrap_or(false))
                        .unwrap_or(true)
                })
                .filter(|p| {
                    brand
                        .map(|b| p.brand.as_deref().map(|pb| pb.eq_ignore_ascii_case(b)).unwrap_or(false))
                        .unwrap_or(true)
                })
                .collect()
        }))
    }

    async fn get_compatible_models(
        &self,
        ps_number: &str,
        brand: Option<&str>,
    ) -> Result<Option<Vec<ApplianceModel>>, StoreError> {
        let ps = ps_number.trim().to_uppercase();
        let models: Option<Vec<ApplianceModel>> = self
            .with_conn(move |conn| {
                if !exists(conn, "SELECT 1 FROM parts WHERE ps_number = ?1", &ps)? {
                    return Ok(None);
                }
                query_all(
                    conn,
                    "SELECT m.data FROM compatibility c JOIN models m ON m.model_number = c.model_number
                     WHERE c.ps_number = ?1 ORDER BY m.model_number",
                    params![ps],
                )
                .map(Some)
            })
            .await?;
        Ok(models.map(|models| {
            models
                .into_iter()
                .filter(|m| {
                    brand
                        .map(|b| m.brand.as_deref().map(|mb| mb.eq_ignore_ascii_case(b)).unwrap_or(false))
                        .unwrap_or(true)
                })
                .collect()
        }))
    }

    async fn get_symptoms(
        &self,
        appliance_type: &str,
        symptom: Option<&str>,
    ) -> Result<Vec<Symptom>, StoreError> {
        let appliance = appliance_type.trim().to_lowercase();
        let all: Vec<Symptom> = self
            .with_conn(move |conn| {
                query_all(
                    conn,
                    "SELECT data FROM symptoms WHERE appliance_type = ?1 ORDER BY id",
                    params![appliance],
                )
            })
            .await?;
        Ok(match symptom {
            Some(wanted) => best_symptom_match(&all, wanted, |s| s.symptom.as_str())
                .cloned()
                .into_iter()
                .collect(),
            None => all,
        })
    }

    async fn get_repair_instructions(
        &self,
        appliance_type: &str,
        symptom: &str,
        part_type: Option<&str>,
    ) -> Result<Vec<RepairInstruction>, StoreError> {
        let appliance = appliance_type.trim().to_lowercase();
        let all: Vec<RepairInstruction> = self
            .with_conn(move |conn| {
                query_all(
                    conn,
                    "SELECT data FROM repair_instructions WHERE appliance_type = ?1 ORDER BY id",
                    params![appliance],
                )
            })
            .await?;
        let Some(matched) =
            best_symptom_match(&all, symptom, |r| r.symptom.as_str()).map(|r| r.symptom.clone())
        else {
            return Ok(Vec::new());
        };
        Ok(all
            .into_iter()
            .filter(|r| r.symptom == matched)
            .filter(|r| part_type.map(|t| contains_ci(&r.part_type, t)).unwrap_or(true))
            .collect())
    }
}

#[async_trait]
impl SimilarityStore for SqliteCatalog {
    async fn search_similar(
        &self,
        collection: SimilarityCollection,
        query: &str,
        scope_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let scope = scope_key.map(|k| k.trim().to_uppercase());
        let docs: Vec<(String, Value)> = match collection {
            SimilarityCollection::Parts => {
                let rows: Vec<Part> = self
                    .with_conn(move |conn| {
                        query_all(
                            conn,
                            "SELECT data FROM parts WHERE ?1 IS NULL OR ps_number = ?1",
                            params![scope],
                        )
                    })
                    .await?;
                rows.iter().map(|p| (part_document(p), to_value(p))).collect()
            }
            SimilarityCollection::Qna => {
                let rows: Vec<QnaEntry> = self.scoped_rows("qna", scope).await?;
                rows.iter()
                    .map(|q| (format!("{} {}", q.question, q.answer), to_value(q)))
                    .collect()
            }
            SimilarityCollection::RepairStories => {
                let rows: Vec<RepairStory> = self.scoped_rows("repair_stories", scope).await?;
                rows.iter()
                    .map(|s| (format!("{} {}", s.title, s.instruction), to_value(s)))
                    .collect()
            }
            SimilarityCollection::Reviews => {
                let rows: Vec<Review> = self.scoped_rows("reviews", scope).await?;
                rows.iter()
                    .map(|r| (format!("{} {}", r.title, r.review_text), to_value(r)))
                    .collect()
            }
        };
        Ok(rank_similar(query, docs, self.threshold, limit))
    }
}

impl SqliteCatalog {
    async fn scoped_rows<T>(&self, table: &'static str, scope: Option<String>) -> Result<Vec<T>, StoreError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.with_conn(move |conn| {
            let sql = format!("SELECT data FROM {table} WHERE ?1 IS NULL OR ps_number = ?1 ORDER BY id");
            query_all(conn, &sql, params![scope])
        })
        .await
    }
}

fn to_value<T: Serialize>(record: &T) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::fixtures::sample_snapshot;

    async fn catalog(dir: &tempfile::TempDir) -> SqliteCatalog {
        let catalog = SqliteCatalog::open(&dir.path().join("catalog.db")).unwrap();
        assert_eq!(catalog.import(sample_snapshot()).await.unwrap(), 4);
        catalog
    }

    #[tokio::test]
    async fn test_sqlite_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(&dir).await;

        let part = catalog.get_part("ps11752778").await.unwrap().unwrap();
        assert_eq!(part.part_name, "Refrigerator Door Shelf Bin");
        assert!(catalog.get_part("PS1").await.unwrap().is_none());

        let by_mpn = catalog.find_by_manufacturer_number("w10350376").await.unwrap();
        assert_eq!(by_mpn.unwrap().ps_number, "PS10065979");
        assert_eq!(catalog.find_by_manufacturer_number_partial("W103").await.unwrap().len(), 2);

        assert_eq!(
            catalog.check_compatibility("PS10065979", "wdt780saem1").await.unwrap(),
            Some(true)
        );
        assert_eq!(catalog.check_compatibility("PS10065979", "NOPE").await.unwrap(), None);

        let models = catalog.get_compatible_models("PS11752778", None).await.unwrap().unwrap();
        assert_eq!(models.len(), 1);
        assert!(catalog.get_compatible_parts("NOPE", None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_search_and_similarity() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(&dir).await;

        let q = PartQuery {
            query: Some("rack adjuster".into()),
            ..Default::default()
        };
        let hits = catalog.search_parts(&q).await.unwrap();
        assert_eq!(hits.len(), 1);

        let qna = catalog
            .search_similar(SimilarityCollection::Qna, "bin fit door", Some("PS11752778"), 5)
            .await
            .unwrap();
        assert_eq!(qna.len(), 1);
        assert!(qna[0]["similarity"].as_f64().unwrap() > 0.5);

        let symptoms = catalog.get_symptoms("Dishwasher", None).await.unwrap();
        assert_eq!(symptoms.len(), 1);
    }
}
