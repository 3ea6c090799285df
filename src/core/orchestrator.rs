//! 编排器：主控循环
//!
//! 一次 run：解析会话记忆 → 构造上下文窗口视图 → Understand 一次 →
//! 循环 { Plan → Execute → Reflect → 反思分析 } → Answer 一次（流式）→ 追加轮次并保存会话 → 指标定稿。
//!
//! 每个阶段都在各自的截止时间内运行；超时或出错只产生一条阶段失败记录，由下游取默认值，运行继续。
//! 只有逃逸出运行主体的错误（如记忆校验失败）会以 StopReason::Error 定稿并返回给调用方。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::core::analyzer::{IterationOutcome, ReflectionAnalyzer, Verdict};
use crate::core::callbacks::AgentCallbacks;
use crate::core::error::AgentError;
use crate::core::events::RunEvent;
use crate::core::metrics::{RunMetrics, StopReason};
use crate::core::state::{PhaseKind, RunState};
use crate::memory::{window_turns, ConversationMemory};
use crate::phases::prompts::render_results;
use crate::phases::{
    AnswerInput, ChannelSink, DynPhase, ExecuteInput, PhaseSet, Plan, PlanInput, ReflectInput,
    Reflection, TaskResult, UnderstandInput, Understanding,
};
use crate::session::SessionStore;

/// Execute 阶段失败时写入结果表的键前缀（后接迭代序号）
pub const EXECUTOR_ERROR_PREFIX: &str = "__executor_error_iter_";

/// 各阶段截止时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub understand: Duration,
    pub plan: Duration,
    pub execute: Duration,
    pub reflect: Duration,
    pub answer: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            understand: Duration::from_secs(30),
            plan: Duration::from_secs(45),
            execute: Duration::from_secs(300),
            reflect: Duration::from_secs(30),
            answer: Duration::from_secs(60),
        }
    }
}

impl PhaseTimeouts {
    pub fn get(&self, kind: PhaseKind) -> Duration {
        match kind {
            PhaseKind::Understand => self.understand,
            PhaseKind::Plan => self.plan,
            PhaseKind::Execute => self.execute,
            PhaseKind::Reflect => self.reflect,
            PhaseKind::Answer => self.answer,
        }
    }

    pub fn set(&mut self, kind: PhaseKind, limit: Duration) {
        match kind {
            PhaseKind::Understand => self.understand = limit,
            PhaseKind::Plan => self.plan = limit,
            PhaseKind::Execute => self.execute = limit,
            PhaseKind::Reflect => self.reflect = limit,
            PhaseKind::Answer => self.answer = limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_iterations: usize,
    /// 上下文窗口保留的最近轮数；None 表示不开窗
    pub context_window_turns: Option<usize>,
    pub timeouts: PhaseTimeouts,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            context_window_turns: Some(6),
            timeouts: PhaseTimeouts::default(),
        }
    }
}

/// 一次运行的请求
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub query: String,
    /// 为空时使用一次性记忆
    pub session_id: Option<String>,
    pub skip_phases: BTreeSet<PhaseKind>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn skip(mut self, phase: PhaseKind) -> Self {
        self.skip_phases.insert(phase);
        self
    }
}

/// 阶段失败的结构化描述
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseFailure {
    pub error: String,
    pub failed: bool,
    pub timeout: bool,
}

#[derive(Debug)]
pub enum PhaseOutcome<T> {
    Completed(T),
    Skipped,
    Failed(PhaseFailure),
}

impl<T> PhaseOutcome<T> {
    pub fn timed_out(&self) -> bool {
        matches!(self, PhaseOutcome::Failed(f) if f.timeout)
    }
}

/// 事件发送端（可选）；发送失败直接忽略
#[derive(Clone, Default)]
struct Emitter(Option<mpsc::UnboundedSender<RunEvent>>);

impl Emitter {
    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

/// 单次运行的可变上下文
struct RunCtx {
    metrics: RunMetrics,
    events: Emitter,
    skip: BTreeSet<PhaseKind>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    phases: PhaseSet,
    sessions: Arc<SessionStore>,
    analyzer: ReflectionAnalyzer,
    callbacks: AgentCallbacks,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, phases: PhaseSet, sessions: Arc<SessionStore>) -> Self {
        Self {
            config,
            phases,
            sessions,
            analyzer: ReflectionAnalyzer::default(),
            callbacks: AgentCallbacks::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: AgentCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_analyzer(mut self, analyzer: ReflectionAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// 运行一次完整的推理流程并返回最终回答
    pub async fn run(&self, query: &str, session_id: Option<&str>) -> Result<String, AgentError> {
        let mut request = RunRequest::new(query);
        request.session_id = session_id.map(str::to_string);
        self.run_with(request, None).await
    }

    /// 同 run，并可通过 events 接收运行过程事件
    pub async fn run_with(
        &self,
        request: RunRequest,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> Result<String, AgentError> {
        let run_id = Uuid::new_v4().to_string();
        let mut ctx = RunCtx {
            metrics: RunMetrics::new(&run_id, &request.query),
            events: Emitter(events),
            skip: request.skip_phases.clone(),
        };
        let span = tracing::info_span!(
            "run",
            run_id = %run_id,
            session = request.session_id.as_deref().unwrap_or("-")
        );

        let result = self.run_body(&request, &mut ctx).instrument(span).await;
        match result {
            Ok((answer, reason)) => {
                self.finalize(&mut ctx, reason);
                Ok(answer)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "run aborted");
                ctx.metrics.record_error(e.to_string());
                ctx.events.emit(RunEvent::Error { text: e.to_string() });
                self.finalize(&mut ctx, StopReason::Error);
                Err(e)
            }
        }
    }

    fn finalize(&self, ctx: &mut RunCtx, reason: StopReason) {
        if !ctx.metrics.finalize(reason) {
            return;
        }
        let json = ctx.metrics.to_json();
        tracing::info!(metrics = %json, "run");
        self.callbacks.metrics(&ctx.metrics);
        ctx.events.emit(RunEvent::Metrics { metrics: json });
    }

    async fn resolve_memory(&self, session_id: Option<&str>) -> ConversationMemory {
        match session_id {
            Some(key) => self.sessions.get_or_create(key).await,
            None => self.sessions.builder().build(),
        }
    }

    async fn run_body(
        &self,
        request: &RunRequest,
        ctx: &mut RunCtx,
    ) -> Result<(String, StopReason), AgentError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(AgentError::EmptyQuery);
        }

        let memory = self.resolve_memory(request.session_id.as_deref()).await;
        let relevant = memory.select_relevant(query).await;
        let relevant = match self.config.context_window_turns {
            Some(k) => window_turns(&relevant, k),
            None => relevant,
        };
        let context = memory.format_for_planning(&relevant);
        let mut state = RunState::new(query, context);

        let understanding = self
            .run_phase(
                &self.phases.understand,
                UnderstandInput {
                    query: state.query.clone(),
                    context: state.context.clone(),
                },
                ctx,
            )
            .await;
        state.understanding = match understanding {
            PhaseOutcome::Completed(u) => u,
            _ => Understanding::minimal(query),
        };
        self.callbacks.understanding(&state.understanding);

        let reason = self.iterate(&mut state, ctx).await;
        ctx.metrics.add_tool_calls(state.results.tool_call_count());

        let answer = self.run_answer(&state, ctx).await;

        memory.add_turn(query, &answer, None).await?;
        if let Some(key) = request.session_id.as_deref() {
            self.sessions.save(key, &memory).await;
        }
        Ok((answer, reason))
    }

    /// Plan → Execute → Reflect 循环，返回停止原因
    async fn iterate(&self, state: &mut RunState, ctx: &mut RunCtx) -> StopReason {
        let max_iterations = self.config.max_iterations.max(1);
        let mut iteration = 0;
        loop {
            iteration += 1;
            ctx.metrics.iteration_count = iteration;
            self.callbacks.iteration_start(iteration);
            ctx.events.emit(RunEvent::IterationStart {
                iteration,
                max_iterations,
            });
            let keys_before = state.results.key_set();

            // Plan
            let plan_outcome = self
                .run_phase(
                    &self.phases.plan,
                    PlanInput {
                        query: state.query.clone(),
                        understanding: state.understanding.clone(),
                        iteration,
                        guidance: state.guidance.clone(),
                        prior_plans: state.plans.clone(),
                        results: state.results.clone(),
                    },
                    ctx,
                )
                .await;
            let plan_timed_out = plan_outcome.timed_out();
            let mut plan = match plan_outcome {
                PhaseOutcome::Completed(p) => p,
                _ => Plan::default(),
            };
            plan.namespace(iteration);
            self.callbacks.plan_created(&plan, iteration);
            ctx.events.emit(RunEvent::PlanCreated {
                iteration,
                summary: plan.summary.clone(),
                task_ids: plan.tasks.iter().map(|t| t.id.clone()).collect(),
            });

            // Execute
            let plan = self.execute(iteration, plan, state, ctx).await;
            state.plans.push(plan);

            // Reflect
            let reflect_outcome = self
                .run_phase(
                    &self.phases.reflect,
                    ReflectInput {
                        query: state.query.clone(),
                        understanding: state.understanding.clone(),
                        iteration,
                        max_iterations,
                        plans: state.plans.clone(),
                        results: state.results.clone(),
                    },
                    ctx,
                )
                .await;
            let reflect_timed_out = reflect_outcome.timed_out();
            let reflection = match reflect_outcome {
                PhaseOutcome::Completed(r) => r,
                PhaseOutcome::Failed(f) => Reflection::inconclusive(f.error),
                PhaseOutcome::Skipped => Reflection::inconclusive("reflect phase skipped"),
            };
            self.callbacks.reflection(&reflection, iteration);
            ctx.events.emit(RunEvent::Reflection {
                iteration,
                is_complete: reflection.is_complete,
                reasoning: reflection.reasoning.clone(),
            });

            let keys_after = state.results.key_set();
            let verdict = self.analyzer.analyze(&IterationOutcome {
                iteration,
                max_iterations,
                reflection: &reflection,
                keys_before: &keys_before,
                keys_after: &keys_after,
                plan_timed_out,
                reflect_timed_out,
            });
            state.last_reflection = Some(reflection);

            match verdict {
                Verdict::Stop(reason) => {
                    tracing::info!(iteration, reason = %reason, "loop stopped");
                    ctx.events.emit(RunEvent::Stopped { reason });
                    return reason;
                }
                Verdict::Continue { guidance } => {
                    tracing::debug!(iteration, has_guidance = guidance.is_some(), "continuing");
                    state.guidance = guidance;
                }
            }
        }
    }

    /// 执行一轮计划；结果经通道回收，阶段超时时已完成任务的结果仍写入结果表
    async fn execute(
        &self,
        iteration: usize,
        plan: Plan,
        state: &mut RunState,
        ctx: &mut RunCtx,
    ) -> Plan {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = self
            .run_phase(
                &self.phases.execute,
                ExecuteInput {
                    iteration,
                    plan: plan.clone(),
                    sink: ChannelSink(tx),
                },
                ctx,
            )
            .await;

        while let Ok((task_id, result)) = rx.try_recv() {
            self.record_task(state, ctx, task_id, result);
        }

        let mut plan = match outcome {
            PhaseOutcome::Completed(report) => report.plan,
            PhaseOutcome::Failed(f) => {
                let result = if f.timeout {
                    TaskResult::timed_out(f.error)
                } else {
                    TaskResult::failure(f.error)
                };
                self.record_task(state, ctx, format!("{EXECUTOR_ERROR_PREFIX}{iteration}"), result);
                plan
            }
            PhaseOutcome::Skipped => plan,
        };
        plan.sync_statuses(&state.results);
        plan
    }

    fn record_task(&self, state: &mut RunState, ctx: &RunCtx, task_id: String, result: TaskResult) {
        self.callbacks.task_complete(&task_id, &result);
        let preview: String = result.display_text().chars().take(200).collect();
        ctx.events.emit(RunEvent::TaskComplete {
            task_id: task_id.clone(),
            failed: result.failed,
            preview,
        });
        state.results.insert(task_id, result);
    }

    /// 带截止时间运行一个阶段，超时 / 出错转为 PhaseOutcome::Failed
    async fn run_phase<I, O>(&self, phase: &DynPhase<I, O>, input: I, ctx: &mut RunCtx) -> PhaseOutcome<O>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let kind = phase.kind();
        if ctx.skip.contains(&kind) {
            tracing::debug!(phase = %kind, "phase skipped");
            return PhaseOutcome::Skipped;
        }
        self.callbacks.phase_start(kind);
        ctx.events.emit(RunEvent::PhaseStart { phase: kind });

        let limit = self.config.timeouts.get(kind);
        let start = Instant::now();
        let result = tokio::time::timeout(limit, phase.run(input)).await;
        ctx.metrics.record_phase(kind, start.elapsed());

        let outcome = match result {
            Ok(Ok(v)) => PhaseOutcome::Completed(v),
            Ok(Err(e)) => {
                tracing::warn!(phase = %kind, error = %e, "phase failed");
                ctx.metrics.record_error(format!("{kind}: {e}"));
                PhaseOutcome::Failed(PhaseFailure {
                    error: e.to_string(),
                    failed: true,
                    timeout: false,
                })
            }
            Err(_) => {
                tracing::warn!(phase = %kind, timeout_ms = limit.as_millis() as u64, "phase timed out");
                PhaseOutcome::Failed(PhaseFailure {
                    error: format!("{kind} phase timed out after {}ms", limit.as_millis()),
                    failed: true,
                    timeout: true,
                })
            }
        };
        self.complete_phase(kind, &outcome, ctx);
        outcome
    }

    fn complete_phase<T>(&self, kind: PhaseKind, outcome: &PhaseOutcome<T>, ctx: &RunCtx) {
        self.callbacks.phase_complete(kind);
        let (failed, timeout, error) = match outcome {
            PhaseOutcome::Failed(f) => (true, f.timeout, Some(f.error.clone())),
            _ => (false, false, None),
        };
        ctx.events.emit(RunEvent::PhaseComplete {
            phase: kind,
            failed,
            timeout,
            error,
        });
    }

    /// Answer 阶段：截止时间覆盖整个流的消费。超时或出错时保留已收到的片段，否则给出兜底文本
    async fn run_answer(&self, state: &RunState, ctx: &mut RunCtx) -> String {
        let kind = PhaseKind::Answer;
        if ctx.skip.contains(&kind) {
            tracing::debug!(phase = %kind, "phase skipped, rendering task results");
            let text = render_results(&state.results);
            self.callbacks.answer_fragment(&text);
            ctx.events.emit(RunEvent::AnswerChunk { text: text.clone() });
            ctx.events.emit(RunEvent::AnswerDone);
            return text;
        }
        self.callbacks.phase_start(kind);
        ctx.events.emit(RunEvent::PhaseStart { phase: kind });

        let input = AnswerInput {
            query: state.query.clone(),
            understanding: state.understanding.clone(),
            plans: state.plans.clone(),
            results: state.results.clone(),
            context: state.context.clone(),
        };
        let limit = self.config.timeouts.answer;
        let start = Instant::now();
        let mut answer = String::new();
        let result = {
            let events = &ctx.events;
            let answer = &mut answer;
            let consume = async move {
                let mut stream = self.phases.answer.run(input).await?;
                while let Some(fragment) = stream.next().await {
                    let fragment = fragment?;
                    self.callbacks.answer_fragment(&fragment);
                    events.emit(RunEvent::AnswerChunk {
                        text: fragment.clone(),
                    });
                    answer.push_str(&fragment);
                }
                Ok::<(), AgentError>(())
            };
            tokio::time::timeout(limit, consume).await
        };
        ctx.metrics.record_phase(kind, start.elapsed());

        let outcome: PhaseOutcome<()> = match result {
            Ok(Ok(())) if !answer.trim().is_empty() => PhaseOutcome::Completed(()),
            Ok(Ok(())) => PhaseOutcome::Failed(PhaseFailure {
                error: "empty response".to_string(),
                failed: true,
                timeout: false,
            }),
            Ok(Err(e)) => {
                tracing::warn!(phase = %kind, error = %e, "answer generation failed");
                ctx.metrics.record_error(format!("{kind}: {e}"));
                PhaseOutcome::Failed(PhaseFailure {
                    error: e.to_string(),
                    failed: true,
                    timeout: false,
                })
            }
            Err(_) => {
                tracing::warn!(phase = %kind, timeout_ms = limit.as_millis() as u64, "answer timed out");
                PhaseOutcome::Failed(PhaseFailure {
                    error: format!("{kind} phase timed out after {}ms", limit.as_millis()),
                    failed: true,
                    timeout: true,
                })
            }
        };
        self.complete_phase(kind, &outcome, ctx);

        if let PhaseOutcome::Failed(f) = &outcome {
            if answer.trim().is_empty() {
                answer = format!("Unable to generate an answer: {}", f.error);
                self.callbacks.answer_fragment(&answer);
                ctx.events.emit(RunEvent::AnswerChunk {
                    text: answer.clone(),
                });
            }
        }
        ctx.events.emit(RunEvent::AnswerDone);
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::stream;

    use crate::llm::{FragmentStream, LlmError};
    use crate::memory::{MemoryBuilder, MemoryConfig};
    use crate::phases::{ExecuteReport, Phase};

    struct FixedUnderstand;

    #[async_trait]
    impl Phase for FixedUnderstand {
        type Input = UnderstandInput;
        type Output = Understanding;
        fn kind(&self) -> PhaseKind {
            PhaseKind::Understand
        }
        async fn run(&self, input: UnderstandInput) -> Result<Understanding, AgentError> {
            Ok(Understanding::minimal(&input.query))
        }
    }

    struct EmptyPlan;

    #[async_trait]
    impl Phase for EmptyPlan {
        type Input = PlanInput;
        type Output = Plan;
        fn kind(&self) -> PhaseKind {
            PhaseKind::Plan
        }
        async fn run(&self, _input: PlanInput) -> Result<Plan, AgentError> {
            Ok(Plan::default())
        }
    }

    struct NoopExecute;

    #[async_trait]
    impl Phase for NoopExecute {
        type Input = ExecuteInput;
        type Output = ExecuteReport;
        fn kind(&self) -> PhaseKind {
            PhaseKind::Execute
        }
        async fn run(&self, input: ExecuteInput) -> Result<ExecuteReport, AgentError> {
            Ok(ExecuteReport {
                plan: input.plan,
                executed: 0,
            })
        }
    }

    struct DoneReflect;

    #[async_trait]
    impl Phase for DoneReflect {
        type Input = ReflectInput;
        type Output = Reflection;
        fn kind(&self) -> PhaseKind {
            PhaseKind::Reflect
        }
        async fn run(&self, _input: ReflectInput) -> Result<Reflection, AgentError> {
            Ok(Reflection {
                is_complete: true,
                ..Default::default()
            })
        }
    }

    /// 先吐出一个片段，然后挂起
    struct StallingAnswer;

    #[async_trait]
    impl Phase for StallingAnswer {
        type Input = AnswerInput;
        type Output = FragmentStream;
        fn kind(&self) -> PhaseKind {
            PhaseKind::Answer
        }
        async fn run(&self, _input: AnswerInput) -> Result<FragmentStream, AgentError> {
            let first = stream::iter(vec![Ok::<_, LlmError>("partial ".to_string())]);
            Ok(Box::pin(first.chain(stream::pending())))
        }
    }

    fn orchestrator(answer: DynPhase<AnswerInput, FragmentStream>) -> Orchestrator {
        let phases = PhaseSet {
            understand: Arc::new(FixedUnderstand),
            plan: Arc::new(EmptyPlan),
            execute: Arc::new(NoopExecute),
            reflect: Arc::new(DoneReflect),
            answer,
        };
        let sessions = Arc::new(SessionStore::new(MemoryBuilder::new(MemoryConfig::default())));
        let mut config = OrchestratorConfig::default();
        config.timeouts.set(PhaseKind::Answer, Duration::from_millis(50));
        Orchestrator::new(config, phases, sessions)
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_timeout_keeps_partial_text() {
        let orch = orchestrator(Arc::new(StallingAnswer));
        let answer = orch.run("hello", None).await.unwrap();
        assert_eq!(answer, "partial ");
    }

    #[tokio::test]
    async fn test_empty_query_is_an_error() {
        let orch = orchestrator(Arc::new(StallingAnswer));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = orch.run_with(RunRequest::new("   "), Some(tx)).await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyQuery));

        let mut saw_error = false;
        let mut saw_metrics = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                RunEvent::Error { .. } => saw_error = true,
                RunEvent::Metrics { metrics } => {
                    saw_metrics = true;
                    assert_eq!(metrics["stop_reason"], "error");
                }
                _ => {}
            }
        }
        assert!(saw_error && saw_metrics);
    }

    #[tokio::test]
    async fn test_skipped_answer_renders_results() {
        let orch = orchestrator(Arc::new(StallingAnswer));
        let answer = orch
            .run_with(RunRequest::new("hi").skip(PhaseKind::Answer), None)
            .await
            .unwrap();
        assert_eq!(answer, "No task results.");
    }
}
