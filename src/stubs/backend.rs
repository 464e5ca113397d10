use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashSet;

use crate::config::SlotLimits;
use crate::core::traits::backend::{Backend, BackendError, Invocation, RawOutput};

/// In-memory backend that records slot lifecycle calls and answers every
/// `exec` with the same result after `delay`.
#[derive(Debug)]
pub struct BackendStub {
    result: Result<RawOutput, BackendError>,
    delay: Duration,
    fail_creates: bool,
    created: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
    dead: DashSet<String>,
}

impl BackendStub {
    pub fn new(result: Result<RawOutput, BackendError>, delay: Duration) -> Self {
        Self {
            result,
            delay,
            fail_creates: false,
            created: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            dead: DashSet::new(),
        }
    }

    pub fn with_failing_creates(mut self) -> Self {
        self.fail_creates = true;
        self
    }

    pub fn mark_dead(&self, name: &str) {
        self.dead.insert(name.to_string());
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Backend for BackendStub {
    #[tracing::instrument(skip(self, limits))]
    async fn create_slot(
        &self,
        name: &str,
        image: &str,
        limits: &SlotLimits,
    ) -> Result<(), BackendError> {
        self.created.lock().unwrap().push(name.to_string());
        if self.fail_creates {
            return Err(BackendError::CreateFailed {
                name: name.to_string(),
                msg: "image not found".to_string(),
            });
        }
        self.dead.remove(name);
        Ok(())
    }

    async fn destroy_slot(&self, name: &str) {
        self.destroyed.lock().unwrap().push(name.to_string());
    }

    async fn is_alive(&self, name: &str) -> bool {
        !self.dead.contains(name)
    }

    async fn copy_in(&self, _name: &str, _host_dir: &Path) -> Result<(), BackendError> {
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn exec(&self, name: &str, invocation: &Invocation) -> Result<RawOutput, BackendError> {
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Stub exec result: {:?}", self.result);
        self.result.clone()
    }
}
