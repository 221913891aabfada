//! Milvus backend over the RESTful v2 API (`/v2/vectordb/...`).
//!
//! Every request names its database explicitly; there is no session-level
//! "use database" state.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value as Json};

use super::{
    CollectionPath, CollectionSchema, ColumnarRecord, ConsistencyLevel, DataType, IndexSpec, Row,
    SearchResult, StoreError, Value, VectorStore,
};

pub const DEFAULT_MILVUS_URL: &str = "http://127.0.0.1:19530";

const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(200);
const LOAD_POLL_ATTEMPTS: usize = 300;

/// Milvus client speaking the REST API.
#[derive(Debug, Clone)]
pub struct MilvusStore {
    client: Client,
    base: url::Url,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Json,
}

impl MilvusStore {
    pub fn new(url: &str, token: Option<&str>) -> Result<Self, StoreError> {
        let base = url::Url::parse(url)?;
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base,
            token: token.filter(|t| !t.is_empty()).map(str::to_string),
        })
    }

    async fn call(&self, endpoint: &str, body: Json) -> Result<Json, StoreError> {
        let url = self.base.join(&format!("v2/vectordb/{endpoint}"))?;
        let mut req = self.client.post(url).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let envelope: Envelope = req.send().await?.error_for_status()?.json().await?;
        if envelope.code != 0 {
            return Err(StoreError::Api {
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }

    async fn load_state(&self, path: &CollectionPath) -> Result<bool, StoreError> {
        let data = self.call("collections/get_load_state", target(path)).await?;
        parse_load_state(&data)
    }
}

fn target(path: &CollectionPath) -> Json {
    json!({ "dbName": path.database, "collectionName": path.collection })
}

fn with(mut body: Json, key: &str, value: Json) -> Json {
    if let Some(obj) = body.as_object_mut() {
        obj.insert(key.to_string(), value);
    }
    body
}

fn string_list(data: Json) -> Result<Vec<String>, StoreError> {
    serde_json::from_value(data).map_err(|e| StoreError::Decode(e.to_string()))
}

fn schema_json(schema: &CollectionSchema) -> Json {
    let fields: Vec<Json> = schema
        .fields
        .iter()
        .map(|f| {
            let mut field = json!({ "fieldName": f.name });
            match f.data_type {
                DataType::Int64 => {
                    field = with(field, "dataType", json!("Int64"));
                }
                DataType::VarChar { max_length } => {
                    field = with(field, "dataType", json!("VarChar"));
                    field = with(
                        field,
                        "elementTypeParams",
                        json!({ "max_length": max_length }),
                    );
                }
                DataType::FloatVector { dim } => {
                    field = with(field, "dataType", json!("FloatVector"));
                    field = with(field, "elementTypeParams", json!({ "dim": dim }));
                }
            }
            if f.is_primary {
                field = with(field, "isPrimary", json!(true));
            }
            field
        })
        .collect();
    let auto_id = schema.primary_key().is_some_and(|f| f.auto_id);
    json!({ "autoId": auto_id, "enableDynamicField": true, "fields": fields })
}

fn row_json(row: &Row) -> Json {
    let obj: Map<String, Json> = row
        .iter()
        .map(|(name, v)| {
            let v = match v {
                Value::Int64(i) => json!(i),
                Value::VarChar(s) => json!(s),
                Value::FloatVector(f) => json!(f),
            };
            (name.clone(), v)
        })
        .collect();
    Json::Object(obj)
}

/// Milvus may return int64 ids as numbers or strings.
fn parse_id(v: &Json) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn parse_row(v: &Json, schema_hint: &[&str], pk: &str) -> Result<Row, StoreError> {
    let obj = v
        .as_object()
        .ok_or_else(|| StoreError::Decode(format!("row is not an object: {v}")))?;
    let mut row = Row::new();
    for (name, value) in obj {
        if name != pk && !schema_hint.contains(&name.as_str()) {
            continue;
        }
        let parsed = if name == pk {
            parse_id(value).map(Value::Int64)
        } else if let Some(i) = value.as_i64() {
            Some(Value::Int64(i))
        } else if let Some(s) = value.as_str() {
            Some(Value::VarChar(s.to_string()))
        } else {
            value.as_array().map(|a| {
                Value::FloatVector(a.iter().filter_map(Json::as_f64).map(|f| f as f32).collect())
            })
        };
        let parsed =
            parsed.ok_or_else(|| StoreError::Decode(format!("unsupported value for {name}")))?;
        row.insert(name.clone(), parsed);
    }
    Ok(row)
}

/// `true` once the collection reports `LoadStateLoaded`.
fn parse_load_state(data: &Json) -> Result<bool, StoreError> {
    data.get("loadState")
        .and_then(Json::as_str)
        .map(|state| state == "LoadStateLoaded")
        .ok_or_else(|| StoreError::Decode(format!("missing loadState in {data}")))
}

fn parse_insert_ids(data: &Json) -> Result<Vec<i64>, StoreError> {
    let ids = data
        .get("insertIds")
        .and_then(Json::as_array)
        .ok_or_else(|| StoreError::Decode(format!("missing insertIds in {data}")))?;
    ids.iter()
        .map(|v| parse_id(v).ok_or_else(|| StoreError::Decode(format!("bad insert id: {v}"))))
        .collect()
}

/// Hits of one query vector. A hit without `distance` scores 0.
fn parse_hits(data: &Json) -> Result<SearchResult, StoreError> {
    let hits = data
        .as_array()
        .ok_or_else(|| StoreError::Decode(format!("search data is not a list: {data}")))?;
    let mut result = SearchResult::default();
    for hit in hits {
        let id = hit
            .get("id")
            .and_then(parse_id)
            .ok_or_else(|| StoreError::Decode(format!("hit without id: {hit}")))?;
        let score = hit.get("distance").and_then(Json::as_f64).unwrap_or_default();
        result.ids.push(id);
        result.scores.push(score as f32);
    }
    Ok(result)
}

#[async_trait]
impl VectorStore for MilvusStore {
    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        string_list(self.call("databases/list", json!({})).await?)
    }

    async fn create_database(&self, name: &str) -> Result<(), StoreError> {
        self.call("databases/create", json!({ "dbName": name }))
            .await
            .map(drop)
    }

    async fn drop_database(&self, name: &str) -> Result<(), StoreError> {
        self.call("databases/drop", json!({ "dbName": name }))
            .await
            .map(drop)
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        string_list(
            self.call("collections/list", json!({ "dbName": database }))
                .await?,
        )
    }

    async fn create_collection(
        &self,
        path: &CollectionPath,
        schema: &CollectionSchema,
        index: &IndexSpec,
    ) -> Result<(), StoreError> {
        schema.validate()?;
        index.validate(schema)?;
        let body = with(target(path), "schema", schema_json(schema));
        let body = with(
            body,
            "indexParams",
            json!([{
                "fieldName": index.field,
                "indexName": index.field,
                "indexType": "AUTOINDEX",
                "metricType": index.metric.as_str(),
            }]),
        );
        self.call("collections/create", body).await.map(drop)
    }

    async fn drop_collection(&self, path: &CollectionPath) -> Result<(), StoreError> {
        self.call("collections/drop", target(path)).await.map(drop)
    }

    async fn load_collection(&self, path: &CollectionPath) -> Result<(), StoreError> {
        self.call("collections/load", target(path)).await?;
        for _ in 0..LOAD_POLL_ATTEMPTS {
            if self.load_state(path).await? {
                return Ok(());
            }
            tokio::time::sleep(LOAD_POLL_INTERVAL).await;
        }
        Err(StoreError::LoadTimeout(path.clone()))
    }

    async fn release_collection(&self, path: &CollectionPath) -> Result<(), StoreError> {
        self.call("collections/release", target(path))
            .await
            .map(drop)
    }

    async fn insert(
        &self,
        path: &CollectionPath,
        record: ColumnarRecord,
    ) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<Json> = record.rows()?.iter().map(row_json).collect();
        let data = self
            .call("entities/insert", with(target(path), "data", Json::Array(rows)))
            .await?;
        parse_insert_ids(&data)
    }

    async fn search(
        &self,
        path: &CollectionPath,
        vector_field: &str,
        queries: &[Vec<f32>],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            let body = with(target(path), "data", json!([query]));
            let body = with(body, "annsField", json!(vector_field));
            let body = with(body, "limit", json!(top_k));
            let data = self.call("entities/search", body).await?;
            results.push(parse_hits(&data)?);
        }
        Ok(results)
    }

    async fn get_by_id(
        &self,
        path: &CollectionPath,
        ids: &[i64],
        output_fields: &[&str],
        consistency: ConsistencyLevel,
    ) -> Result<Vec<Row>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_list = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
        let pk = super::ID_FIELD;
        let body = with(target(path), "filter", json!(format!("{pk} in [{id_list}]")));
        let body = with(body, "outputFields", json!(output_fields));
        let body = with(body, "limit", json!(ids.len()));
        let body = with(body, "consistencyLevel", json!(consistency.as_str()));
        let data = self.call("entities/query", body).await?;
        let rows = data
            .as_array()
            .ok_or_else(|| StoreError::Decode(format!("query data is not a list: {data}")))?;
        rows.iter()
            .map(|r| parse_row(r, output_fields, pk))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FILENAME_FIELD, LINE_START_FIELD, VECTOR_FIELD};

    #[test]
    fn schema_json_matches_rest_shape() {
        let v = schema_json(&CollectionSchema::chunks(768));
        assert_eq!(v["autoId"], json!(true));
        let fields = v["fields"].as_array().unwrap();
        assert_eq!(fields[0]["fieldName"], json!("id"));
        assert_eq!(fields[0]["isPrimary"], json!(true));
        assert_eq!(fields[1]["elementTypeParams"]["max_length"], json!(256));
        assert_eq!(fields[4]["fieldName"], json!(VECTOR_FIELD));
        assert_eq!(fields[4]["elementTypeParams"]["dim"], json!(768));
    }

    #[test]
    fn rows_parse_string_and_numeric_ids() {
        let pk = "id";
        let fields = [FILENAME_FIELD, LINE_START_FIELD];
        let row = parse_row(
            &json!({ "id": "449", "filename": "a.txt", "line_start": 3, "extra": 1 }),
            &fields,
            pk,
        )
        .unwrap();
        assert_eq!(row["id"].as_i64(), Some(449));
        assert_eq!(row[FILENAME_FIELD].as_str(), Some("a.txt"));
        assert_eq!(row[LINE_START_FIELD].as_i64(), Some(3));
        assert!(!row.contains_key("extra"));
    }

    #[test]
    fn bad_url_is_rejected() {
        assert!(MilvusStore::new("not a url", None).is_err());
        assert!(MilvusStore::new(DEFAULT_MILVUS_URL, Some("root:Milvus")).is_ok());
    }

    #[test]
    fn search_hits_decode_in_order() {
        let data = json!([
            { "id": 7, "distance": 0.9, "filename": "a.txt" },
            { "id": "449983", "distance": 0.25 },
            { "id": 8 },
        ]);
        let result = parse_hits(&data).unwrap();
        assert_eq!(result.ids, vec![7, 449983, 8]);
        assert_eq!(result.scores, vec![0.9, 0.25, 0.0]);
        assert_eq!(parse_hits(&json!([])).unwrap(), SearchResult::default());
    }

    #[test]
    fn malformed_search_data_is_a_decode_error() {
        let no_id = parse_hits(&json!([{ "distance": 0.5 }]));
        assert!(matches!(no_id, Err(StoreError::Decode(_))));
        let bad_id = parse_hits(&json!([{ "id": "abc", "distance": 0.5 }]));
        assert!(matches!(bad_id, Err(StoreError::Decode(_))));
        let not_a_list = parse_hits(&json!({ "id": 1 }));
        assert!(matches!(not_a_list, Err(StoreError::Decode(_))));
    }

    #[test]
    fn insert_ids_accept_numbers_and_strings() {
        let ids = parse_insert_ids(&json!({ "insertCount": 2, "insertIds": [1, "2"] })).unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert!(matches!(
            parse_insert_ids(&json!({ "insertCount": 0 })),
            Err(StoreError::Decode(_))
        ));
        assert!(matches!(
            parse_insert_ids(&json!({ "insertIds": [null] })),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn load_state_is_loaded_only_when_reported() {
        assert!(parse_load_state(&json!({ "loadState": "LoadStateLoaded" })).unwrap());
        assert!(!parse_load_state(&json!({ "loadState": "LoadStateLoading" })).unwrap());
        assert!(matches!(parse_load_state(&json!({})), Err(StoreError::Decode(_))));
    }
}
