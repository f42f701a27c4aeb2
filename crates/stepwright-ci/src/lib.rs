//! Stepwright CI - step execution for self-correcting pipelines
//!
//! Provides the pipeline run controller that:
//! - Applies each step through an external mutation agent under a process supervisor
//! - Verifies the artifact tree with toolchain stages (resolve, analyze, test, build)
//! - Remediates failed gates and validations within policy bounds
//! - Records step and stage metrics for health reporting

pub mod agent;
pub mod gate;
pub mod pipeline;
pub mod remediation;
pub mod stage;
pub mod supervisor;
pub mod toolchain;
pub mod validators;

// Re-export key types
pub use agent::{render_prompt, AgentOutcome, AgentRequest, CommandAgent, MutationAgent};
pub use gate::{classify_analysis, count_markers, GateRun, MarkerCounts, VerificationGate};
pub use pipeline::{run_pipeline, Collaborators, PipelineController};
pub use remediation::{AttemptRecorder, RemediationLoop, RemediationResult};
pub use stage::{StageResult, ToolchainStage};
pub use supervisor::{
    BoundedBuffer, CommandSpec, ExitReason, ProcessSupervisor, SupervisedOutput, SupervisorLimits,
};
pub use toolchain::{CommandToolchain, Toolchain};
pub use validators::{
    infer_topic, CommandFeatureCheck, CriteriaValidator, FeatureCheck, StepKind, StepValidator,
    TopicValidator, ValidatorRegistry,
};
