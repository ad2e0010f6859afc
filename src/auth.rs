use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared cleartext password for every login. The user name is not checked
/// here; it only decides which actor the session acts as.
#[derive(Debug)]
pub struct MedbookAuthSource {
    password: String,
}

impl MedbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for MedbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(
            "login attempt user={} database={}",
            login.user().unwrap_or("-"),
            login.database().unwrap_or("-")
        );
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
