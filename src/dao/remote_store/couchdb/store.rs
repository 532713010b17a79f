use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::dao::{
    models::{FieldUpdates, SessionDocument, apply_updates},
    remote_store::RemoteStore,
    storage::StorageResult,
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
};

const ID_FIELD: &str = "_id";
const REV_FIELD: &str = "_rev";
const PUT_ATTEMPTS: usize = 2;

/// Stores the session snapshot as one CouchDB document.
#[derive(Clone)]
pub struct CouchRemoteStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    document_id: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
}

impl CouchRemoteStore {
    /// Connect and make sure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let store = Self {
            client,
            base_url: Arc::from(config.base_url.trim_end_matches('/')),
            database: Arc::from(config.database),
            document_id: Arc::from(config.document_id),
            auth: config
                .username
                .zip(config.password)
                .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p))),
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth {
            Some((ref user, ref pass)) => builder.basic_auth(user.as_ref(), Some(pass.as_ref())),
            None => builder,
        }
    }

    fn database_url(&self) -> String {
        format!("{}/{}", self.base_url, self.database)
    }

    fn document_request(&self, method: Method) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.database_url(), self.document_id);
        self.authorize(self.client.request(method, url))
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let url = self.database_url();

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .authorize(self.client.put(&url))
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                if create.status().is_success() {
                    debug!(database = %database, "created couchdb database");
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn fetch_raw(&self) -> CouchResult<Option<Value>> {
        let path = self.document_id.to_string();
        let response = self
            .document_request(Method::GET)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: path.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<Value>()
                .await
                .map(Some)
                .map_err(|source| CouchDaoError::DecodeResponse { path, source }),
            other => Err(CouchDaoError::RequestStatus {
                path,
                status: other,
            }),
        }
    }

    async fn put_raw(&self, document: &Value) -> CouchResult<()> {
        let path = self.document_id.to_string();
        let response = self
            .document_request(Method::PUT)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: path.clone(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CouchDaoError::RequestStatus {
                path,
                status: response.status(),
            })
        }
    }

    /// Read the current revision, let `build` produce the next body, and write it.
    ///
    /// A conflicting concurrent write is retried once with the fresh revision.
    async fn write_with_revision<F>(&self, mut build: F) -> CouchResult<()>
    where
        F: FnMut(Option<Value>) -> Option<Value>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.fetch_raw().await?;
            let revision = current
                .as_ref()
                .and_then(|doc| doc.get(REV_FIELD))
                .cloned();
            let Some(mut next) = build(current) else {
                return Ok(());
            };
            if let Value::Object(map) = &mut next {
                map.insert(ID_FIELD.into(), Value::String(self.document_id.to_string()));
                match revision {
                    Some(rev) => map.insert(REV_FIELD.into(), rev),
                    None => map.remove(REV_FIELD),
                };
            }
            match self.put_raw(&next).await {
                Err(CouchDaoError::RequestStatus { status, .. })
                    if status == StatusCode::CONFLICT && attempt < PUT_ATTEMPTS =>
                {
                    debug!("couchdb revision conflict; retrying");
                }
                result => return result,
            }
        }
    }
}

impl RemoteStore for CouchRemoteStore {
    fn name(&self) -> &'static str {
        "couchdb"
    }

    fn save_document(&self, document: SessionDocument) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let body = serde_json::to_value(&document).map_err(|source| {
                CouchDaoError::InvalidDocument {
                    path: store.document_id.to_string(),
                    source,
                }
            })?;
            store
                .write_with_revision(|_| Some(body.clone()))
                .await
                .map_err(Into::into)
        })
    }

    fn load_document(&self) -> BoxFuture<'static, StorageResult<Option<SessionDocument>>> {
        let store = self.clone();
        Box::pin(async move {
            let Some(mut raw) = store.fetch_raw().await? else {
                return Ok(None);
            };
            if let Value::Object(map) = &mut raw {
                map.remove(ID_FIELD);
                map.remove(REV_FIELD);
            }
            let document = serde_json::from_value(raw).map_err(|source| {
                CouchDaoError::InvalidDocument {
                    path: store.document_id.to_string(),
                    source,
                }
            })?;
            Ok(Some(document))
        })
    }

    fn apply_updates(&self, updates: FieldUpdates) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .write_with_revision(|current| {
                    let mut doc = current?;
                    apply_updates(&mut doc, &updates);
                    Some(doc)
                })
                .await
                .map_err(Into::into)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let url = store.database_url();
            let response = store
                .authorize(store.client.get(&url))
                .send()
                .await
                .map_err(|source| CouchDaoError::RequestSend {
                    path: url.clone(),
                    source,
                })?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(CouchDaoError::RequestStatus {
                    path: url,
                    status: response.status(),
                }
                .into())
            }
        })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}
