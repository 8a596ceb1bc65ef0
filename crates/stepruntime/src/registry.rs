use std::collections::{BTreeMap, HashMap};
use stepcore::{validate_step, Flow, Step, StepConfig, ValidationError};

/// Flow lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowEvent {
    Created,
    Updated,
    Removed,
}

/// Step lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepEvent {
    Created,
    Updated,
    Removed,
}

pub type FlowCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type StepCallback = Box<dyn Fn(&Step) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct MutationOptions {
    /// Skip the lifecycle info log lines.
    pub quiet: bool,
}

/// Authoritative set of steps and the flows derived from them.
///
/// Mutations are expected from a single control thread; callers that share a
/// registry across tasks wrap it in a lock.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Step>,
    active: Vec<String>,
    dev: Vec<String>,
    flows: BTreeMap<String, Flow>,
    flow_callbacks: HashMap<FlowEvent, Vec<FlowCallback>>,
    step_callbacks: HashMap<StepEvent, Vec<StepCallback>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow lifecycle callback. Callbacks run synchronously, in registration order.
    pub fn on_flow(&mut self, event: FlowEvent, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.flow_callbacks
            .entry(event)
            .or_default()
            .push(Box::new(callback));
    }

    /// Register a step lifecycle callback. Callbacks run synchronously, in registration order.
    pub fn on_step(&mut self, event: StepEvent, callback: impl Fn(&Step) + Send + Sync + 'static) {
        self.step_callbacks
            .entry(event)
            .or_default()
            .push(Box::new(callback));
    }

    /// Admit a new step. An invalid step is rejected and nothing changes.
    pub fn create_step(&mut self, step: Step, opts: MutationOptions) -> Result<(), ValidationError> {
        self.check(&step)?;

        if self.steps.contains_key(&step.file_path) {
            let old = self.steps[&step.file_path].clone();
            return self.update_step(&old, step, opts);
        }

        let file_path = step.file_path.clone();
        self.classify(&file_path, &step.config);

        for flow_name in unique(step.flows()) {
            self.join_flow(flow_name, &file_path);
        }

        self.steps.insert(file_path.clone(), step);
        let step = &self.steps[&file_path];

        if !opts.quiet {
            tracing::info!("Step created: {} ({})", step.name(), step.file_path);
        }
        self.fire_step(StepEvent::Created, step);

        Ok(())
    }

    /// Replace `old` with `new`. An invalid `new` removes the old step entirely, if it was held.
    pub fn update_step(&mut self, old: &Step, new: Step, opts: MutationOptions) -> Result<(), ValidationError> {
        if let Err(e) = self.check(&new) {
            if self.steps.contains_key(&old.file_path) {
                self.delete_step(old, opts);
            }
            return Err(e);
        }

        if old.file_path != new.file_path {
            self.delete_step(old, opts);
            return self.create_step(new, opts);
        }

        let file_path = new.file_path.clone();
        let Some(saved) = self.steps.get(&file_path) else {
            return self.create_step(new, opts);
        };

        // Membership is diffed against what the registry holds, not what the caller remembers.
        let old_flows: Vec<String> = unique(saved.flows()).into_iter().cloned().collect();
        let new_flows: Vec<String> = unique(new.flows()).into_iter().cloned().collect();

        if saved.config.is_dev_only() != new.config.is_dev_only() {
            self.declassify(&file_path);
            self.classify(&file_path, &new.config);
        }

        for flow_name in old_flows.iter().filter(|f| new_flows.contains(f)) {
            self.fire_flow(FlowEvent::Updated, flow_name);
        }

        for flow_name in new_flows.iter().filter(|f| !old_flows.contains(f)) {
            self.join_flow(flow_name, &file_path);
        }

        for flow_name in old_flows.iter().filter(|f| !new_flows.contains(f)) {
            self.leave_flow(flow_name, &file_path);
        }

        self.steps.insert(file_path.clone(), new);
        let step = &self.steps[&file_path];

        if !opts.quiet {
            tracing::info!("Step updated: {} ({})", step.name(), step.file_path);
        }
        self.fire_step(StepEvent::Updated, step);

        Ok(())
    }

    /// Remove a step and leave every flow it belonged to.
    pub fn delete_step(&mut self, step: &Step, opts: MutationOptions) {
        self.declassify(&step.file_path);
        let saved = self.steps.remove(&step.file_path);

        let mut flow_names: Vec<String> = unique(step.flows()).into_iter().cloned().collect();
        if let Some(saved) = &saved {
            for name in saved.flows() {
                if !flow_names.contains(name) {
                    flow_names.push(name.clone());
                }
            }
        }

        for flow_name in &flow_names {
            self.leave_flow(flow_name, &step.file_path);
        }

        if !opts.quiet {
            tracing::info!("Step removed: {} ({})", step.name(), step.file_path);
        }
        self.fire_step(StepEvent::Removed, saved.as_ref().unwrap_or(step));
    }

    pub fn step(&self, file_path: &str) -> Option<&Step> {
        self.steps.get(file_path)
    }

    pub fn active_steps(&self) -> Vec<&Step> {
        self.active.iter().filter_map(|p| self.steps.get(p)).collect()
    }

    pub fn dev_steps(&self) -> Vec<&Step> {
        self.dev.iter().filter_map(|p| self.steps.get(p)).collect()
    }

    pub fn event_steps(&self) -> Vec<&Step> {
        self.active_steps()
            .into_iter()
            .filter(|s| matches!(s.config, StepConfig::Event(_)))
            .collect()
    }

    pub fn api_steps(&self) -> Vec<&Step> {
        self.active_steps()
            .into_iter()
            .filter(|s| matches!(s.config, StepConfig::Api(_)))
            .collect()
    }

    pub fn cron_steps(&self) -> Vec<&Step> {
        self.active_steps()
            .into_iter()
            .filter(|s| matches!(s.config, StepConfig::Cron(_)))
            .collect()
    }

    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flows.get(name)
    }

    pub fn flow_steps(&self, name: &str) -> Vec<&Step> {
        self.flows
            .get(name)
            .map(|f| f.steps.iter().filter_map(|p| self.steps.get(p)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn check(&self, step: &Step) -> Result<(), ValidationError> {
        validate_step(step).map_err(|e| {
            tracing::error!("[step registry] {}", e);
            e
        })
    }

    fn classify(&mut self, file_path: &str, config: &StepConfig) {
        if config.is_dev_only() {
            self.dev.push(file_path.to_string());
        } else {
            self.active.push(file_path.to_string());
        }
    }

    fn declassify(&mut self, file_path: &str) {
        self.active.retain(|p| p != file_path);
        self.dev.retain(|p| p != file_path);
    }

    fn join_flow(&mut self, flow_name: &str, file_path: &str) {
        match self.flows.get_mut(flow_name) {
            Some(flow) => {
                flow.add_step(file_path);
                self.fire_flow(FlowEvent::Updated, flow_name);
            }
            None => {
                let mut flow = Flow::new(flow_name);
                flow.add_step(file_path);
                self.flows.insert(flow_name.to_string(), flow);
                tracing::info!("Flow created: {}", flow_name);
                self.fire_flow(FlowEvent::Created, flow_name);
            }
        }
    }

    fn leave_flow(&mut self, flow_name: &str, file_path: &str) {
        let Some(flow) = self.flows.get_mut(flow_name) else {
            return;
        };
        if !flow.contains(file_path) {
            return;
        }

        flow.remove_step(file_path);
        if flow.is_empty() {
            self.flows.remove(flow_name);
            tracing::info!("Flow removed: {}", flow_name);
            self.fire_flow(FlowEvent::Removed, flow_name);
        } else {
            self.fire_flow(FlowEvent::Updated, flow_name);
        }
    }

    fn fire_flow(&self, event: FlowEvent, flow_name: &str) {
        if let Some(callbacks) = self.flow_callbacks.get(&event) {
            for callback in callbacks {
                callback(flow_name);
            }
        }
    }

    fn fire_step(&self, event: StepEvent, step: &Step) {
        if let Some(callbacks) = self.step_callbacks.get(&event) {
            for callback in callbacks {
                callback(step);
            }
        }
    }
}

fn unique(names: &[String]) -> Vec<&String> {
    let mut seen: Vec<&String> = Vec::with_capacity(names.len());
    for name in names {
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}
