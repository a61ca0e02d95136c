use crate::error::{TransportError, TransportResult, ValidationError};
use crate::event::{Event, TransportEvent};
use crate::utils::unix_millis;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const DEFAULT_TIMESTAMP_SKEW: Duration = Duration::from_secs(300);

/// Configuration for the validation pipeline.
///
/// Every check is independently enabled by its own field; the zero values
/// (`0`, empty set, empty list) disable the corresponding check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Master switch; when false no check runs and incoming events are not
    /// annotated.
    pub enabled: bool,
    /// Maximum serialized payload size in bytes; 0 means unbounded.
    pub max_message_size: usize,
    /// Accepted event types; empty means any type is accepted.
    pub allowed_event_types: HashSet<String>,
    /// Payload fields that must be present and non-empty.
    pub required_fields: Vec<String>,
    /// Field name to regex source; a present field must match its pattern.
    pub pattern_validators: HashMap<String, String>,
    /// Reject events whose timestamp is unset or outside the skew window.
    pub validate_timestamps: bool,
    /// Accepted distance between the event timestamp and now.
    pub timestamp_skew: Duration,
    /// Reject payload fields that are neither required nor pattern-validated.
    pub strict_mode: bool,
    /// Stop at the first violation instead of gathering all of them.
    pub fail_fast: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_message_size: 0,
            allowed_event_types: HashSet::new(),
            required_fields: Vec::new(),
            pattern_validators: HashMap::new(),
            validate_timestamps: false,
            timestamp_skew: DEFAULT_TIMESTAMP_SKEW,
            strict_mode: false,
            fail_fast: false,
        }
    }
}

/// A compiled validation pipeline.
///
/// Regexes compile once at construction so the per-event path never parses
/// pattern sources. The validator owns its config: the pair is installed and
/// replaced as one value, which is what keeps readers from ever observing a
/// validator with a stale configuration.
#[derive(Debug)]
pub struct Validator {
    config: ValidationConfig,
    patterns: Vec<(String, Regex)>,
}

impl Validator {
    /// Compiles the configuration. An invalid regex surfaces as a
    /// configuration error naming the offending field.
    pub fn new(config: ValidationConfig) -> TransportResult<Self> {
        let mut patterns = Vec::with_capacity(config.pattern_validators.len());
        for (field, source) in &config.pattern_validators {
            let regex = Regex::new(source).map_err(|e| TransportError::Configuration {
                field: format!("pattern_validators.{field}"),
                value: source.clone(),
                message: e.to_string(),
            })?;
            patterns.push((field.clone(), regex));
        }
        Ok(Self { config, patterns })
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Validates an event about to be sent. Rejection here means the
    /// transport is never invoked for the event.
    pub fn validate_outgoing(&self, event: &dyn TransportEvent) -> Result<(), ValidationError> {
        if !self.config.enabled {
            return Ok(());
        }
        self.check(event)
    }

    /// Validates a received envelope. The result is only ever used to stamp
    /// metadata; incoming events are annotated, never dropped.
    pub fn validate_incoming(&self, envelope: &Event) -> Result<(), ValidationError> {
        if !self.config.enabled {
            return Ok(());
        }
        self.check(envelope.event.as_ref())
    }

    fn check(&self, event: &dyn TransportEvent) -> Result<(), ValidationError> {
        let mut violations = Vec::new();

        if self.config.max_message_size > 0 {
            let size = event.serialized_size();
            if size > self.config.max_message_size {
                let violation = ValidationError::InvalidMessageSize {
                    size,
                    max: self.config.max_message_size,
                };
                if self.config.fail_fast {
                    return Err(violation);
                }
                violations.push(violation);
            }
        }

        if !self.config.allowed_event_types.is_empty()
            && !self.config.allowed_event_types.contains(event.event_type())
        {
            let violation = ValidationError::InvalidEventType {
                event_type: event.event_type().to_string(),
            };
            if self.config.fail_fast {
                return Err(violation);
            }
            violations.push(violation);
        }

        let payload = event.payload();

        if !self.config.required_fields.is_empty() {
            let missing: Vec<String> = self
                .config
                .required_fields
                .iter()
                .filter(|field| !Self::present_and_non_empty(payload.get(field.as_str())))
                .cloned()
                .collect();
            if !missing.is_empty() {
                let violation = ValidationError::MissingRequiredFields { fields: missing };
                if self.config.fail_fast {
                    return Err(violation);
                }
                violations.push(violation);
            }
        }

        for (field, regex) in &self.patterns {
            let Some(value) = payload.get(field.as_str()) else {
                // absent fields are the concern of required_fields
                continue;
            };
            if !regex.is_match(&Self::string_form(value)) {
                let violation = ValidationError::FieldValidationFailed {
                    field: field.clone(),
                    pattern: regex.as_str().to_string(),
                };
                if self.config.fail_fast {
                    return Err(violation);
                }
                violations.push(violation);
            }
        }

        if self.config.validate_timestamps {
            let timestamp = event.timestamp();
            let skew = self.config.timestamp_skew.as_millis() as u64;
            if timestamp == 0 || timestamp.abs_diff(unix_millis()) > skew {
                let violation = ValidationError::InvalidTimestamp { timestamp };
                if self.config.fail_fast {
                    return Err(violation);
                }
                violations.push(violation);
            }
        }

        if self.config.strict_mode {
            for field in payload.keys() {
                if !self.is_known_field(field) {
                    let violation = ValidationError::UnknownField {
                        field: field.clone(),
                    };
                    if self.config.fail_fast {
                        return Err(violation);
                    }
                    violations.push(violation);
                }
            }
        }

        match violations.len() {
            0 => Ok(()),
            1 => Err(violations.remove(0)),
            _ => Err(ValidationError::Failed(violations)),
        }
    }

    fn is_known_field(&self, field: &str) -> bool {
        self.config.required_fields.iter().any(|f| f == field)
            || self.config.pattern_validators.contains_key(field)
    }

    fn present_and_non_empty(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// String form a pattern is matched against: strings as-is, everything
    /// else via its JSON rendering.
    fn string_form(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
