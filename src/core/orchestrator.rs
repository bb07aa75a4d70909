//! Main orchestrator for pipeline execution.
//!
//! Sequences or fans out stage invocations, threads text between stages,
//! publishes stage lifecycle events, and hands the final text to the
//! post-processor.

use std::time::Instant;

use futures::future::try_join_all;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{Capability, CapabilityError, Fragment, StageInput};
use crate::domain::{
    token_proxy, Phase, PipelineOutcome, Progress, RunId, StageEvent, StageMeta, Telemetry,
};

use super::event_bus::EventBus;
use super::pipeline::{FanOutRoster, Roster, SequentialRoster};
use super::postprocess::PostProcessor;

/// Separator placed between parallel outputs before the merge stage
pub const MERGE_DELIMITER: &str = "\n\n---\n\n";

/// Errors that abort a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' (step {step}) failed: {source}")]
    Stage {
        step: usize,
        stage: String,
        #[source]
        source: CapabilityError,
    },

    #[error("pipeline roster is empty")]
    EmptyRoster,
}

impl PipelineError {
    fn stage(step: usize, stage: &dyn Capability, source: CapabilityError) -> Self {
        Self::Stage {
            step,
            stage: stage.name().to_string(),
            source,
        }
    }
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    bus: EventBus,
    post: PostProcessor,
}

impl Orchestrator {
    /// Create an orchestrator publishing to `bus`, with no template generators
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            post: PostProcessor::new(),
        }
    }

    pub fn with_post_processor(mut self, post: PostProcessor) -> Self {
        self.post = post;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn post_processor(&self) -> &PostProcessor {
        &self.post
    }

    /// Run stages strictly in order, feeding each the previous output
    pub async fn run_sequential(
        &self,
        roster: &SequentialRoster,
        input: &str,
    ) -> Result<String, PipelineError> {
        if roster.is_empty() {
            return Err(PipelineError::EmptyRoster);
        }

        let mut current = input.to_string();
        for (idx, stage) in roster.stages.iter().enumerate() {
            debug!(step = idx + 1, stage = stage.name(), "running stage");
            current = stage
                .invoke(&StageInput::Text(current))
                .await
                .map_err(|e| PipelineError::stage(idx + 1, stage.as_ref(), e))?;
        }

        Ok(current)
    }

    /// Draft once, review the draft concurrently, then merge the reviews
    pub async fn run_fan_out_merge(
        &self,
        roster: &FanOutRoster,
        input: &str,
    ) -> Result<String, PipelineError> {
        let draft = roster
            .writer
            .invoke(&StageInput::from(input))
            .await
            .map_err(|e| PipelineError::stage(1, roster.writer.as_ref(), e))?;

        let reviews = roster.parallel.iter().enumerate().map(|(idx, stage)| {
            let draft = &draft;
            async move {
                stage
                    .invoke(&StageInput::Text(draft.clone()))
                    .await
                    .map_err(|e| PipelineError::stage(idx + 2, stage.as_ref(), e))
            }
        });
        let outputs = try_join_all(reviews).await?;

        let Some(merge_input) = merge_input(&outputs) else {
            debug!("parallel group produced no output, returning draft");
            return Ok(draft);
        };

        roster
            .merge
            .invoke(&StageInput::Text(merge_input))
            .await
            .map_err(|e| PipelineError::stage(roster.total_steps(), roster.merge.as_ref(), e))
    }

    /// Run a roster in whichever mode it declares, publishing stage events
    pub async fn run_traced(
        &self,
        roster: &Roster,
        input: &str,
        run_id: Option<RunId>,
    ) -> Result<PipelineOutcome, PipelineError> {
        match roster {
            Roster::Sequential(roster) => self.run_sequential_traced(roster, input, run_id).await,
            Roster::FanOut(roster) => self.run_fan_out_merge_traced(roster, input, run_id).await,
        }
    }

    /// Sequential run with stage events and post-processing.
    ///
    /// The caller owns the run lifetime and signals `finish` on the bus. When
    /// no run id is supplied the generated one is finished here if the run
    /// fails, since the caller never learns it.
    #[instrument(skip_all, fields(run_id))]
    pub async fn run_sequential_traced(
        &self,
        roster: &SequentialRoster,
        input: &str,
        run_id: Option<RunId>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let generated = run_id.is_none();
        let run_id = self.open_run(run_id);
        let result = self.sequential_stages(roster, input, &run_id).await;
        self.settle(run_id, generated, result).await
    }

    async fn sequential_stages(
        &self,
        roster: &SequentialRoster,
        input: &str,
        run_id: &RunId,
    ) -> Result<String, PipelineError> {
        if roster.is_empty() {
            return Err(PipelineError::EmptyRoster);
        }

        info!(stages = roster.len(), "starting sequential run");
        let total = roster.len();
        let mut current = input.to_string();
        for (idx, stage) in roster.stages.iter().enumerate() {
            let tracker = StageTracker::start(
                self.bus.clone(),
                run_id.clone(),
                idx + 1,
                total,
                stage.name(),
                roster.meta_for(idx),
                &current,
            );
            current = self.invoke_traced(tracker, stage.as_ref(), &current).await?;
        }

        info!("sequential run complete");
        Ok(current)
    }

    /// Fan-out run with stage events and post-processing.
    ///
    /// Progress totals are `1 + parallel + 1`. The caller signals `finish`,
    /// except for a generated run id on failure.
    #[instrument(skip_all, fields(run_id))]
    pub async fn run_fan_out_merge_traced(
        &self,
        roster: &FanOutRoster,
        input: &str,
        run_id: Option<RunId>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let generated = run_id.is_none();
        let run_id = self.open_run(run_id);
        let result = self.fan_out_stages(roster, input, &run_id).await;
        self.settle(run_id, generated, result).await
    }

    async fn fan_out_stages(
        &self,
        roster: &FanOutRoster,
        input: &str,
        run_id: &RunId,
    ) -> Result<String, PipelineError> {
        let total = roster.total_steps();
        info!(parallel = roster.parallel.len(), "starting fan-out run");

        let tracker = StageTracker::start(
            self.bus.clone(),
            run_id.clone(),
            1,
            total,
            roster.writer.name(),
            roster.writer_meta(),
            input,
        );
        let draft = self
            .invoke_traced(tracker, roster.writer.as_ref(), input)
            .await?;

        let reviews = roster.parallel.iter().enumerate().map(|(idx, stage)| {
            let tracker = StageTracker::start(
                self.bus.clone(),
                run_id.clone(),
                idx + 2,
                total,
                stage.name(),
                roster.member_meta(idx),
                &draft,
            );
            self.invoke_traced(tracker, stage.as_ref(), &draft)
        });
        let outputs = try_join_all(reviews).await?;

        let final_text = match merge_input(&outputs) {
            Some(merged) => {
                let tracker = StageTracker::start(
                    self.bus.clone(),
                    run_id.clone(),
                    total,
                    total,
                    roster.merge.name(),
                    roster.merge_meta(),
                    &merged,
                );
                self.invoke_traced(tracker, roster.merge.as_ref(), &merged)
                    .await?
            }
            None => {
                warn!("parallel group produced no output, falling back to draft");
                draft
            }
        };

        info!("fan-out run complete");
        Ok(final_text)
    }

    fn open_run(&self, run_id: Option<RunId>) -> RunId {
        let run_id = run_id.unwrap_or_else(|| self.bus.new_run_id());
        tracing::Span::current().record("run_id", tracing::field::display(&run_id));
        self.bus.ensure_run(&run_id);
        run_id
    }

    /// Post-process a completed run, or release a generated run id on failure
    async fn settle(
        &self,
        run_id: RunId,
        generated: bool,
        result: Result<String, PipelineError>,
    ) -> Result<PipelineOutcome, PipelineError> {
        match result {
            Ok(text) => Ok(self.post.finalize(run_id, text).await),
            Err(err) => {
                if generated {
                    self.bus.finish(&run_id);
                }
                Err(err)
            }
        }
    }

    /// Invoke one stage, publishing delta and terminal events through `tracker`
    async fn invoke_traced(
        &self,
        mut tracker: StageTracker,
        stage: &dyn Capability,
        input: &str,
    ) -> Result<String, PipelineError> {
        let step = tracker.step;
        match drive_stage(stage, &StageInput::from(input), &mut tracker).await {
            Ok(text) => {
                tracker.end();
                Ok(text)
            }
            Err(source) => {
                tracker.fail(&source.to_string());
                Err(PipelineError::stage(step, stage, source))
            }
        }
    }
}

/// Pull the stage's output, preferring streamed deltas, then a streamed full
/// response, then a plain `invoke`
async fn drive_stage(
    stage: &dyn Capability,
    input: &StageInput,
    tracker: &mut StageTracker,
) -> Result<String, CapabilityError> {
    let mut output = String::new();
    let mut last_response: Option<String> = None;

    if let Some(mut fragments) = stage.invoke_streaming(input).await? {
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            if let Fragment::Response(text) = &fragment {
                if !text.trim().is_empty() {
                    last_response = Some(text.clone());
                }
            }
            for piece in fragment.text_pieces() {
                output.push_str(piece);
                tracker.delta(piece);
            }
        }
    }

    if !output.trim().is_empty() {
        return Ok(output);
    }
    if let Some(text) = last_response {
        return Ok(text);
    }
    stage.invoke(input).await
}

/// Join parallel outputs in roster order; `None` when every output is blank
fn merge_input(outputs: &[String]) -> Option<String> {
    if outputs.iter().all(|o| o.trim().is_empty()) {
        return None;
    }
    Some(outputs.join(MERGE_DELIMITER))
}

/// Publishes the events of one stage invocation.
///
/// Guarantees a single terminal event: if dropped before `end`/`fail`
/// (the run was cancelled), it publishes an `error` event itself.
struct StageTracker {
    bus: EventBus,
    run_id: RunId,
    step: usize,
    total: usize,
    agent: String,
    meta: StageMeta,
    started: Instant,
    tokens_in: u64,
    tokens_out: u64,
    terminated: bool,
}

impl StageTracker {
    fn start(
        bus: EventBus,
        run_id: RunId,
        step: usize,
        total: usize,
        agent: &str,
        meta: StageMeta,
        input: &str,
    ) -> Self {
        let tracker = Self {
            bus,
            run_id,
            step,
            total,
            agent: agent.to_string(),
            meta,
            started: Instant::now(),
            tokens_in: token_proxy(input),
            tokens_out: 0,
            terminated: false,
        };
        info!(run_id = %tracker.run_id, step, stage = %tracker.agent, "stage started");
        tracker.publish(tracker.event(Phase::Start));
        tracker
    }

    fn event(&self, phase: Phase) -> StageEvent {
        StageEvent::new(
            self.run_id.clone(),
            self.step,
            self.agent.clone(),
            phase,
            self.meta.clone(),
            Progress::new(self.step.min(self.total), self.total),
            Telemetry {
                tokens_in: self.tokens_in,
                tokens_out: self.tokens_out,
                latency_ms: self.started.elapsed().as_millis() as u64,
            },
        )
    }

    fn publish(&self, event: StageEvent) {
        self.bus.emit(event);
    }

    fn delta(&mut self, chunk: &str) {
        self.tokens_out += token_proxy(chunk);
        self.publish(self.event(Phase::Delta).with_delta(chunk));
    }

    fn end(&mut self) {
        self.terminated = true;
        info!(
            run_id = %self.run_id,
            step = self.step,
            stage = %self.agent,
            tokens_out = self.tokens_out,
            latency_ms = self.started.elapsed().as_millis() as u64,
            "stage completed"
        );
        let summary = format!("{} completed", self.agent);
        self.publish(self.event(Phase::End).with_summary(summary));
    }

    fn fail(&mut self, message: &str) {
        self.terminated = true;
        error!(
            run_id = %self.run_id,
            step = self.step,
            stage = %self.agent,
            error = %message,
            "stage failed"
        );
        self.publish(self.event(Phase::Error).with_error(message));
    }
}

impl Drop for StageTracker {
    fn drop(&mut self) {
        if !self.terminated {
            warn!(run_id = %self.run_id, step = self.step, stage = %self.agent, "stage cancelled");
            self.terminated = true;
            self.publish(self.event(Phase::Error).with_error("cancelled"));
        }
    }
}
