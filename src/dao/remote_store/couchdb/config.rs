use super::error::{CouchDaoError, CouchResult};

const DEFAULT_DOCUMENT_ID: &str = "game_state";

/// Where the session snapshot lives in CouchDB.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    pub base_url: String,
    pub database: String,
    /// Identifier of the single snapshot document.
    pub document_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CouchConfig {
    pub fn new(base_url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            database: database.into(),
            document_id: DEFAULT_DOCUMENT_ID.to_string(),
            username: None,
            password: None,
        }
    }

    /// Attach basic-auth credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Read `COUCH_BASE_URL`, `COUCH_DB`, the optional `COUCH_DOC_ID` and
    /// the optional `COUCH_USERNAME`/`COUCH_PASSWORD` pair.
    pub fn from_env() -> CouchResult<Self> {
        let required = |var: &'static str| {
            std::env::var(var).map_err(|_| CouchDaoError::MissingEnvVar { var })
        };
        let mut config = Self::new(required("COUCH_BASE_URL")?, required("COUCH_DB")?);

        if let Ok(document_id) = std::env::var("COUCH_DOC_ID") {
            config.document_id = document_id;
        }
        if let (Ok(username), Ok(password)) = (
            std::env::var("COUCH_USERNAME"),
            std::env::var("COUCH_PASSWORD"),
        ) {
            config = config.with_credentials(username, password);
        }
        Ok(config)
    }
}
