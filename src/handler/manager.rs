//! Management RPC group: application registrations.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::auth::{authorize, TokenValidator};
use crate::proto::application_manager_server::ApplicationManager as ApplicationManagerTrait;
use crate::proto::{Ack, Application, ApplicationIdentifier};
use crate::storage::KvStore;

const APPLICATION_KEY_PREFIX: &str = "handler:application:";

/// Store key holding an application registration.
pub fn application_key(app_id: &str) -> String {
    format!("{}{}", APPLICATION_KEY_PREFIX, app_id)
}

/// Check an application id: 2 to 36 characters of `[a-z0-9_-]`.
pub fn validate_app_id(app_id: &str) -> Result<(), Status> {
    let valid_len = (2..=36).contains(&app_id.len());
    let valid_chars = app_id
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(Status::invalid_argument(format!(
            "invalid application id '{}'",
            app_id
        )))
    }
}

/// Stored form of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub app_id: String,
    #[serde(default)]
    pub description: String,
}

impl From<ApplicationRecord> for Application {
    fn from(record: ApplicationRecord) -> Self {
        Application {
            app_id: record.app_id,
            description: record.description,
        }
    }
}

/// Implements the `ApplicationManager` service group.
pub struct ManagerRpc {
    store: Arc<dyn KvStore>,
    validator: Arc<dyn TokenValidator>,
}

impl ManagerRpc {
    pub fn new(store: Arc<dyn KvStore>, validator: Arc<dyn TokenValidator>) -> Self {
        Self { store, validator }
    }

    fn authorize<T>(&self, request: &Request<T>) -> Result<(), Status> {
        authorize(request.metadata(), self.validator.as_ref()).map_err(Status::from)
    }
}

fn store_status(app_id: &str, e: impl std::fmt::Display) -> Status {
    error!(app_id = %app_id, error = %e, "Store operation failed");
    Status::unavailable(e.to_string())
}

#[tonic::async_trait]
impl ApplicationManagerTrait for ManagerRpc {
    async fn register_application(
        &self,
        request: Request<Application>,
    ) -> Result<Response<Ack>, Status> {
        self.authorize(&request)?;
        let app = request.into_inner();
        validate_app_id(&app.app_id)?;

        let record = ApplicationRecord {
            app_id: app.app_id,
            description: app.description,
        };
        let value = serde_json::to_vec(&record).map_err(|e| Status::internal(e.to_string()))?;
        self.store
            .set(&application_key(&record.app_id), value)
            .await
            .map_err(|e| store_status(&record.app_id, e))?;

        info!(app_id = %record.app_id, "Application registered");
        Ok(Response::new(Ack {}))
    }

    async fn get_application(
        &self,
        request: Request<ApplicationIdentifier>,
    ) -> Result<Response<Application>, Status> {
        self.authorize(&request)?;
        let app_id = request.into_inner().app_id;
        validate_app_id(&app_id)?;

        let value = self
            .store
            .get(&application_key(&app_id))
            .await
            .map_err(|e| store_status(&app_id, e))?
            .ok_or_else(|| Status::not_found(format!("application '{}' not found", app_id)))?;
        let record: ApplicationRecord = serde_json::from_slice(&value)
            .map_err(|e| Status::internal(format!("corrupt application record: {}", e)))?;

        Ok(Response::new(record.into()))
    }

    async fn delete_application(
        &self,
        request: Request<ApplicationIdentifier>,
    ) -> Result<Response<Ack>, Status> {
        self.authorize(&request)?;
        let app_id = request.into_inner().app_id;
        validate_app_id(&app_id)?;

        let existed = self
            .store
            .delete(&application_key(&app_id))
            .await
            .map_err(|e| store_status(&app_id, e))?;
        if !existed {
            return Err(Status::not_found(format!(
                "application '{}' not found",
                app_id
            )));
        }

        info!(app_id = %app_id, "Application deleted");
        Ok(Response::new(Ack {}))
    }
}
