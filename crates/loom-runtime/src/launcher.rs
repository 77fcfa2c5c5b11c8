use loom_types::{Feature, WorkerRole};

/// Builds the argv for an external code-agent subprocess. The core never
/// constructs shell strings and never knows the specifics of any one
/// code-agent binary; that knowledge lives entirely behind this trait,
/// which the embedding application supplies.
pub trait WorkerLauncher: Send + Sync {
    fn build_argv(
        &self,
        role: &WorkerRole,
        feature: &Feature,
        custom_prompt: Option<&str>,
        model_hint: Option<&str>,
    ) -> Vec<String>;
}

/// A launcher driven entirely by configuration: a fixed binary plus a
/// prompt built from the feature and role. Suitable when the embedding
/// application points at a single code-agent CLI that accepts a prompt as
/// its final positional argument.
#[derive(Debug, Clone)]
pub struct TemplateLauncher {
    pub binary: String,
    pub base_args: Vec<String>,
}

impl TemplateLauncher {
    pub fn new(binary: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            base_args,
        }
    }
}

impl WorkerLauncher for TemplateLauncher {
    fn build_argv(
        &self,
        role: &WorkerRole,
        feature: &Feature,
        custom_prompt: Option<&str>,
        model_hint: Option<&str>,
    ) -> Vec<String> {
        let mut argv = vec![self.binary.clone()];
        argv.extend(self.base_args.iter().cloned());
        if let Some(model) = model_hint {
            argv.push("--model".to_string());
            argv.push(model.to_string());
        }
        argv.push(prompt_for(role, feature, custom_prompt));
        argv
    }
}

fn prompt_for(role: &WorkerRole, feature: &Feature, custom_prompt: Option<&str>) -> String {
    if let Some(custom) = custom_prompt {
        return custom.to_string();
    }
    match role {
        WorkerRole::Implementor => format!("Implement: {}", feature.description),
        WorkerRole::PlannerA => format!(
            "Draft approach A for: {}. Write your plan as JSON to the deterministic plan file.",
            feature.description
        ),
        WorkerRole::PlannerB => format!(
            "Draft approach B for: {}. Write your plan as JSON to the deterministic plan file.",
            feature.description
        ),
        WorkerRole::Voter(n) => format!(
            "Independently implement (voter {n} of a redundant group): {}",
            feature.description
        ),
        WorkerRole::CodeReviewer => "Review the session's changes for code quality.".to_string(),
        WorkerRole::ArchReviewer => "Review the session's changes for architectural fit.".to_string(),
    }
}
