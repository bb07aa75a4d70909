//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use revue::adapters::{
    Capability, CapabilityError, Fragment, FragmentStream, GeneratorError, GeneratorInput,
    StageInput, TemplateGenerator,
};
use revue::core::Subscription;
use revue::domain::{GeneratedTemplate, StageEvent, TemplateKind};

type Respond = Box<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

/// How a scripted stage hands back its output
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Only `invoke`
    Whole,
    /// Word-by-word deltas
    Deltas,
    /// A single full-response fragment
    ResponseOnly,
}

/// A stage whose output is computed from its input by a closure
pub struct ScriptedStage {
    name: String,
    respond: Respond,
    delay: Duration,
    delivery: Delivery,
    seen: Mutex<Vec<String>>,
}

impl ScriptedStage {
    pub fn new(
        name: &str,
        respond: impl Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            respond: Box::new(respond),
            delay: Duration::ZERO,
            delivery: Delivery::Whole,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(name: &str, text: &str) -> Self {
        let text = text.to_string();
        Self::new(name, move |_| Ok(text.clone()))
    }

    pub fn failing(name: &str, message: &str) -> Self {
        let message = message.to_string();
        Self::new(name, move |_| Err(message.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Inputs received so far, in call order
    pub fn seen_inputs(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    async fn produce(&self, input: &StageInput) -> Result<String, CapabilityError> {
        let text = input.to_text();
        self.seen.lock().unwrap().push(text.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(&text).map_err(|message| CapabilityError::failed(&self.name, message))
    }
}

#[async_trait]
impl Capability for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &StageInput) -> Result<String, CapabilityError> {
        self.produce(input).await
    }

    async fn invoke_streaming(
        &self,
        input: &StageInput,
    ) -> Result<Option<FragmentStream>, CapabilityError> {
        let fragments: Vec<Fragment> = match self.delivery {
            Delivery::Whole => return Ok(None),
            Delivery::Deltas => {
                let text = self.produce(input).await?;
                text.split_inclusive(' ')
                    .map(|piece| Fragment::Delta(piece.to_string()))
                    .collect()
            }
            Delivery::ResponseOnly => vec![Fragment::Response(self.produce(input).await?)],
        };
        let stream = futures::stream::iter(fragments.into_iter().map(Ok));
        Ok(Some(stream.boxed()))
    }
}

/// Generator returning fixed content and recording what it was given
pub struct ScriptedGenerator {
    kind: TemplateKind,
    result: Result<String, String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn ok(kind: TemplateKind, content: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            result: Ok(content.to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(kind: TemplateKind, message: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            result: Err(message.to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// "payload" or "narrative" per call
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TemplateGenerator for ScriptedGenerator {
    fn kind(&self) -> TemplateKind {
        self.kind
    }

    async fn generate(
        &self,
        input: GeneratorInput<'_>,
    ) -> Result<GeneratedTemplate, GeneratorError> {
        let label = match input {
            GeneratorInput::Payload(_) => "payload",
            GeneratorInput::Narrative(_) => "narrative",
        };
        self.calls.lock().unwrap().push(label.to_string());

        match &self.result {
            Ok(content) => Ok(GeneratedTemplate::new(content.clone())),
            Err(message) => Err(GeneratorError::Failed {
                kind: self.kind,
                message: message.clone(),
            }),
        }
    }
}

/// Drain a subscription until the run's sentinel
pub async fn collect(subscription: Subscription) -> Vec<Arc<StageEvent>> {
    subscription.collect().await
}

/// Events of one stage, in arrival order
pub fn events_for<'a>(events: &'a [Arc<StageEvent>], agent: &str) -> Vec<&'a StageEvent> {
    events
        .iter()
        .filter(|e| e.agent == agent)
        .map(|e| e.as_ref())
        .collect()
}

/// Erase a scripted stage into a roster entry
pub fn stage(s: &Arc<ScriptedStage>) -> Arc<dyn Capability> {
    s.clone()
}
