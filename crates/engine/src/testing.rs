use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use pushq_gateway::{GatewayError, PushGateway, PushMessage};

enum Fallback {
    Succeed(String),
    Fail(String),
}

/// Gateway that answers from a script, then from a fallback.
pub(crate) struct ScriptedGateway {
    script: Mutex<VecDeque<Result<String, GatewayError>>>,
    fallback: Fallback,
    delay: Option<Duration>,
    sent: Mutex<Vec<PushMessage>>,
}

impl ScriptedGateway {
    pub(crate) fn new(script: Vec<Result<String, GatewayError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Fallback::Fail("script exhausted".to_string()),
            delay: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn succeeding(message_id: &str) -> Self {
        Self {
            fallback: Fallback::Succeed(message_id.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            fallback: Fallback::Fail(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushGateway for ScriptedGateway {
    async fn send(&self, message: &PushMessage) -> Result<String, GatewayError> {
        self.sent.lock().unwrap().push(message.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => match &self.fallback {
                Fallback::Succeed(id) => Ok(id.clone()),
                Fallback::Fail(message) => Err(GatewayError::Rejected {
                    status: 400,
                    code: None,
                    message: message.clone(),
                }),
            },
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
