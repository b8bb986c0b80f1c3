// batch_ingestor/src/auth.rs
// Credentials consumed by the transport on every call. Refresh is handled elsewhere.

/// Supplies the headers to attach to the next request.
pub trait CredentialsProvider: Send + Sync {
    fn headers(&self,) -> Vec<(String, String,),>;
}

pub struct NoAuth;

impl CredentialsProvider for NoAuth {
    fn headers(&self,) -> Vec<(String, String,),> {
        Vec::new()
    }
}

/// Static API key sent as a bearer token.
pub struct ApiKey {
    key: String,
}

impl ApiKey {
    pub fn new(key: impl Into<String,>,) -> Self {
        Self { key: key.into(), }
    }
}

impl CredentialsProvider for ApiKey {
    fn headers(&self,) -> Vec<(String, String,),> {
        vec![("Authorization".to_string(), format!("Bearer {}", self.key),)]
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_,>,) -> std::fmt::Result {
        f.debug_struct("ApiKey",).field("key", &"***",).finish()
    }
}
