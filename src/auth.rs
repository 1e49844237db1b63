use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::limits::MAX_IDENTITY_LEN;
use crate::model::Role;

/// Password lookup keyed by the role the client asks for. The database
/// name is the role; staff desks share one password, customers another.
#[derive(Debug)]
pub struct BayflowAuthSource {
    staff_password: String,
    customer_password: String,
}

impl BayflowAuthSource {
    pub fn new(staff_password: String, customer_password: String) -> Self {
        Self {
            staff_password,
            customer_password,
        }
    }

    fn password_for(&self, user: Option<&str>, database: Option<&str>) -> Result<&str, Rejection> {
        let role: Role = database
            .unwrap_or_default()
            .parse()
            .map_err(|_| {
                reject(
                    "3D000",
                    format!(
                        "unknown database {:?}; use sale, service or customer",
                        database.unwrap_or_default()
                    ),
                )
            })?;

        let user = user.unwrap_or_default();
        if user.is_empty() || user.len() > MAX_IDENTITY_LEN {
            return Err(reject("28000", "user name must be 1 to 128 bytes".into()));
        }

        match role {
            Role::Customer => {
                if Ulid::from_string(user).is_err() {
                    return Err(reject("28000", "customer user must be an account id".into()));
                }
                Ok(&self.customer_password)
            }
            Role::Sale | Role::Service => Ok(&self.staff_password),
        }
    }
}

/// Why a login was refused, before it becomes a wire error.
#[derive(Debug)]
struct Rejection {
    code: &'static str,
    message: String,
}

fn reject(code: &'static str, message: String) -> Rejection {
    Rejection { code, message }
}

#[async_trait]
impl AuthSource for BayflowAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        match self.password_for(login.user(), login.database()) {
            Ok(password) => Ok(Password::new(None, password.as_bytes().to_vec())),
            Err(rejection) => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL, "reason" => rejection.code)
                    .increment(1);
                tracing::warn!("login rejected: {}", rejection.message);
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    rejection.code.into(),
                    rejection.message,
                ))))
            }
        }
    }
}
