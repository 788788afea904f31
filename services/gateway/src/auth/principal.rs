/// Identity carried by a validated credential. Immutable; lives for the
/// duration of one request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub issued_at: Option<i64>,
    pub expires_at: i64,
    pub scopes: Vec<String>,
    pub email: Option<String>,
    pub username: Option<String>,
}

impl Principal {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}
