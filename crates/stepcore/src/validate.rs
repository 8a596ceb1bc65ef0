use crate::{Emit, FieldError, Step, StepConfig, ValidationError};

/// Check a step against the rules of its declared type.
pub fn validate_step(step: &Step) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if step.file_path.trim().is_empty() {
        errors.push(FieldError::new("filePath", "must not be empty"));
    }

    if step.config.name().trim().is_empty() {
        errors.push(FieldError::new("config.name", "must not be empty"));
    }

    check_names(&mut errors, "config.flows", step.config.flows());

    match &step.config {
        StepConfig::Event(config) => {
            check_names(&mut errors, "config.subscribes", &config.subscribes);
            check_emits(&mut errors, "config.emits", &config.emits);
            if let Some(virtual_emits) = &config.virtual_emits {
                check_emits(&mut errors, "config.virtualEmits", virtual_emits);
            }
        }
        StepConfig::Api(config) => {
            if !config.path.starts_with('/') {
                errors.push(FieldError::new("config.path", "must start with '/'"));
            }
            check_emits(&mut errors, "config.emits", &config.emits);
            if let Some(virtual_subscribes) = &config.virtual_subscribes {
                check_names(&mut errors, "config.virtualSubscribes", virtual_subscribes);
            }
        }
        StepConfig::Cron(config) => {
            if config.cron.trim().is_empty() {
                errors.push(FieldError::new("config.cron", "must not be empty"));
            }
            check_emits(&mut errors, "config.emits", &config.emits);
        }
        StepConfig::Noop(config) => {
            check_emits(&mut errors, "config.virtualEmits", &config.virtual_emits);
            check_names(&mut errors, "config.virtualSubscribes", &config.virtual_subscribes);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            file_path: step.file_path.clone(),
            errors,
        })
    }
}

fn check_names(errors: &mut Vec<FieldError>, path: &str, names: &[String]) {
    for (i, name) in names.iter().enumerate() {
        if name.trim().is_empty() {
            errors.push(FieldError::new(format!("{path}.{i}"), "must not be empty"));
        }
    }
}

fn check_emits(errors: &mut Vec<FieldError>, path: &str, emits: &[Emit]) {
    for (i, emit) in emits.iter().enumerate() {
        if emit.topic().trim().is_empty() {
            errors.push(FieldError::new(format!("{path}.{i}"), "topic must not be empty"));
        }
    }
}
