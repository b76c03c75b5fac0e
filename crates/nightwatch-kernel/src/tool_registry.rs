//! [`ToolRegistry`] – the closed set of tools the confirmation gate accepts.
//!
//! The registry is built once from configuration and validated as a whole.
//! Lookups of names that were never registered fail with
//! [`SafetyError::UnknownTool`]; there is no fallback tier.

use std::collections::BTreeMap;

use nightwatch_types::{
    ConfirmationTier, EffectorCommand, OperatorReply, ReplyClass, SafetyError, ToolAction,
    ToolClass, ToolSpec,
};

/// Validated tool lookup table.
///
/// # Example
///
/// ```
/// use nightwatch_kernel::tool_registry::{standard_tools, ToolRegistry};
/// use nightwatch_types::{ConfirmationTier, SafetyError};
///
/// let registry = ToolRegistry::new(standard_tools()).unwrap();
/// assert_eq!(registry.get("park_telescope").unwrap().base_tier, ConfirmationTier::Confirm);
/// assert!(matches!(registry.get("launch_rocket"), Err(SafetyError::UnknownTool(_))));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    /// Build a registry.
    ///
    /// # Errors
    ///
    /// [`SafetyError::InvalidConfig`] when a name is empty, malformed or
    /// duplicated, when a tool's class and action disagree, when an abort
    /// tool carries a confirmation tier, when a tool that does not park,
    /// close or stop imaging claims to be safe-ward, or when a confirmation
    /// phrase could be satisfied by a generic reply.
    pub fn new(tools: Vec<ToolSpec>) -> Result<Self, SafetyError> {
        let mut map = BTreeMap::new();
        for tool in tools {
            validate(&tool)?;
            if map.contains_key(&tool.name) {
                return Err(SafetyError::InvalidConfig(format!(
                    "tool '{}' is registered twice",
                    tool.name
                )));
            }
            map.insert(tool.name.clone(), tool);
        }
        Ok(Self { tools: map })
    }

    /// # Errors
    ///
    /// [`SafetyError::UnknownTool`] for unregistered names.
    pub fn get(&self, name: &str) -> Result<&ToolSpec, SafetyError> {
        self.tools
            .get(name)
            .ok_or_else(|| SafetyError::UnknownTool(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn validate(tool: &ToolSpec) -> Result<(), SafetyError> {
    let invalid =
        |msg: &str| Err(SafetyError::InvalidConfig(format!("tool '{}': {msg}", tool.name)));

    if tool.name.is_empty()
        || !tool
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return invalid("names must be non-empty snake_case");
    }

    if !tool.action.fits(tool.class) {
        return invalid(match tool.class {
            ToolClass::Abort => "abort tools must drive abort_slew or disable_motors",
            ToolClass::Hardware => "hardware tools must drive an effector or slew",
            ToolClass::Session => "session tools must start or stop imaging",
            ToolClass::Query => "query tools must report status or weather",
        });
    }
    if tool.is_abort() && tool.base_tier != ConfirmationTier::None {
        return invalid("abort tools are never gated");
    }
    let safing = matches!(
        tool.action,
        ToolAction::Effector(EffectorCommand::Park | EffectorCommand::CloseEnclosure)
            | ToolAction::StopImaging
    );
    if tool.safe_ward && !safing {
        return invalid("only park, close and stop-imaging tools can be safe-ward");
    }

    if let Some(phrase) = &tool.confirm_phrase {
        let reply = OperatorReply::classify(phrase);
        if reply.text.is_empty() || reply.class != ReplyClass::Unrecognized {
            return invalid("confirm phrase must be specific to the operation");
        }
    }
    Ok(())
}

/// Default observatory tool table.
pub fn standard_tools() -> Vec<ToolSpec> {
    use ToolAction::{Effector, ReportStatus, ReportWeather, SlewTo, StartImaging, StopImaging};

    let tool = |name: &str, class, action, base_tier, disruptive, announcement: Option<&str>| {
        ToolSpec {
            name: name.to_string(),
            class,
            action,
            base_tier,
            disruptive,
            safe_ward: false,
            announcement: announcement.map(str::to_string),
            confirm_phrase: None,
        }
    };
    let safe_ward = |tool: ToolSpec| ToolSpec {
        safe_ward: true,
        ..tool
    };
    vec![
        tool(
            "emergency_stop",
            ToolClass::Abort,
            Effector(EffectorCommand::DisableMotors),
            ConfirmationTier::None,
            false,
            None,
        ),
        tool(
            "abort_slew",
            ToolClass::Abort,
            Effector(EffectorCommand::AbortSlew),
            ConfirmationTier::None,
            false,
            None,
        ),
        safe_ward(tool(
            "park_telescope",
            ToolClass::Hardware,
            Effector(EffectorCommand::Park),
            ConfirmationTier::Confirm,
            true,
            Some("Parking the telescope."),
        )),
        tool(
            "unpark_telescope",
            ToolClass::Hardware,
            Effector(EffectorCommand::Unpark),
            ConfirmationTier::Announce,
            false,
            Some("Unparking the telescope."),
        ),
        tool(
            "slew_to",
            ToolClass::Hardware,
            SlewTo,
            ConfirmationTier::Announce,
            true,
            Some("Slewing the telescope."),
        ),
        tool(
            "open_enclosure",
            ToolClass::Hardware,
            Effector(EffectorCommand::OpenEnclosure),
            ConfirmationTier::Confirm,
            false,
            Some("Opening the enclosure."),
        ),
        safe_ward(tool(
            "close_enclosure",
            ToolClass::Hardware,
            Effector(EffectorCommand::CloseEnclosure),
            ConfirmationTier::Confirm,
            true,
            Some("Closing the enclosure."),
        )),
        tool(
            "start_imaging",
            ToolClass::Session,
            StartImaging,
            ConfirmationTier::Announce,
            false,
            Some("Starting the imaging sequence."),
        ),
        safe_ward(tool(
            "stop_imaging",
            ToolClass::Session,
            StopImaging,
            ConfirmationTier::Confirm,
            true,
            Some("Stopping the imaging sequence."),
        )),
        tool(
            "get_weather",
            ToolClass::Query,
            ReportWeather,
            ConfirmationTier::None,
            false,
            None,
        ),
        tool(
            "get_status",
            ToolClass::Query,
            ReportStatus,
            ConfirmationTier::None,
            false,
            None,
        ),
    ]
}
