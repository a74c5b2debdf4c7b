use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::tenant::{self, DEFAULT_TENANT};
use crate::wire::user_error;

/// Cleartext password check shared by every tenant. Staff identity travels in
/// the statements themselves, not in the login.
///
/// The database name picks the tenant, so a name no tenant could ever take is
/// refused here, before the password exchange.
#[derive(Debug)]
pub struct SlotkeeperAuthSource {
    password: String,
}

impl SlotkeeperAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotkeeperAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let database = login.database().unwrap_or(DEFAULT_TENANT);
        if let Err(e) = tenant::check_tenant_name(database) {
            tracing::warn!(host = login.host(), "login refused: {e}");
            return Err(user_error("3D000", format!("invalid database name: {e}")));
        }
        tracing::debug!(
            user = login.user().unwrap_or(""),
            database,
            host = login.host(),
            "login"
        );
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
