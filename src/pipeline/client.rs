//! Client for the metadata service endpoints the pipeline consumes.

use crate::error::{Result, TableRagError};
use crate::model::{ColLookupMap, ColMap, DbInfo, KnMap, TbMap};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

#[async_trait]
pub trait MetaApi: Send + Sync {
    async fn get_table(&self, db_code: &str) -> Result<(DbInfo, TbMap)>;
    async fn get_column(
        &self,
        db_code: &str,
        tb_col_tuple_list: &[(String, String)],
    ) -> Result<ColLookupMap>;
    async fn retrieve_knowledge(
        &self,
        db_code: &str,
        query: &str,
        keywords: &[String],
    ) -> Result<KnMap>;
    async fn retrieve_column(&self, db_code: &str, keywords: &[String]) -> Result<ColMap>;
    async fn retrieve_cell(&self, db_code: &str, keywords: &[String]) -> Result<ColMap>;
}

pub struct HttpMetaApi {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl HttpMetaApi {
    /// `base_url` up to and including `/api/v1`.
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
            client: reqwest::Client::new(),
        }
    }

    async fn post<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| TableRagError::Internal {
            message: format!("metadata service request failed: {}", e),
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TableRagError::Internal {
                message: format!("metadata service error {}: {}", status, text),
            });
        }
        response.json().await.map_err(|e| TableRagError::Data {
            message: format!("malformed metadata service response: {}", e),
        })
    }
}

#[async_trait]
impl MetaApi for HttpMetaApi {
    async fn get_table(&self, db_code: &str) -> Result<(DbInfo, TbMap)> {
        self.post("/metadata/get_table", &json!({ "db_code": db_code }))
            .await
    }

    async fn get_column(
        &self,
        db_code: &str,
        tb_col_tuple_list: &[(String, String)],
    ) -> Result<ColLookupMap> {
        self.post(
            "/metadata/get_column",
            &json!({ "db_code": db_code, "tb_col_tuple_list": tb_col_tuple_list }),
        )
        .await
    }

    async fn retrieve_knowledge(
        &self,
        db_code: &str,
        query: &str,
        keywords: &[String],
    ) -> Result<KnMap> {
        self.post(
            "/metadata/retrieve_knowledge",
            &json!({ "db_code": db_code, "query": query, "keywords": keywords }),
        )
        .await
    }

    async fn retrieve_column(&self, db_code: &str, keywords: &[String]) -> Result<ColMap> {
        self.post(
            "/metadata/retrieve_column",
            &json!({ "db_code": db_code, "keywords": keywords }),
        )
        .await
    }

    async fn retrieve_cell(&self, db_code: &str, keywords: &[String]) -> Result<ColMap> {
        self.post(
            "/metadata/retrieve_cell",
            &json!({ "db_code": db_code, "keywords": keywords }),
        )
        .await
    }
}
