use serde::Deserialize;
use serde::Serialize;

/// Outcome code shared by every layer of the agent, from a single handler
/// capability call up to the whole deployment.
///
/// The numeric space is partitioned into ranges so that a code can be
/// classified without enumerating every constant:
///
/// - `0` and `500..` are failures,
/// - `200..300` are successes, including the reboot/restart-requesting and
///   install-state variants,
/// - `300..400` are successes of the skipped kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const FAILURE: ResultCode = ResultCode(0);
    pub const SUCCESS: ResultCode = ResultCode(200);
    pub const IN_PROGRESS: ResultCode = ResultCode(202);
    pub const SUCCESS_REBOOT_REQUIRED: ResultCode = ResultCode(205);
    pub const SUCCESS_IMMEDIATE_REBOOT_REQUIRED: ResultCode = ResultCode(206);
    pub const SUCCESS_AGENT_RESTART_REQUIRED: ResultCode = ResultCode(207);
    pub const SUCCESS_IMMEDIATE_AGENT_RESTART_REQUIRED: ResultCode = ResultCode(208);
    pub const INSTALLED: ResultCode = ResultCode(210);
    pub const NOT_INSTALLED: ResultCode = ResultCode(211);
    pub const SKIPPED_UPDATE_ALREADY_INSTALLED: ResultCode = ResultCode(302);
    pub const SKIPPED_NO_MATCHING_COMPONENTS: ResultCode = ResultCode(303);
    pub const FAILURE_CANCELLED: ResultCode = ResultCode(512);

    pub fn is_success(self) -> bool {
        (200..500).contains(&self.0)
    }

    pub fn is_failure(self) -> bool {
        self.0 == 0 || self.0 >= 500
    }

    pub fn indicates_in_progress(self) -> bool {
        self == ResultCode::IN_PROGRESS
    }

    pub fn is_skipped(self) -> bool {
        (300..400).contains(&self.0)
    }

    pub fn requires_reboot(self) -> bool {
        matches!(
            self,
            ResultCode::SUCCESS_REBOOT_REQUIRED | ResultCode::SUCCESS_IMMEDIATE_REBOOT_REQUIRED
        )
    }

    pub fn requires_agent_restart(self) -> bool {
        matches!(
            self,
            ResultCode::SUCCESS_AGENT_RESTART_REQUIRED
                | ResultCode::SUCCESS_IMMEDIATE_AGENT_RESTART_REQUIRED
        )
    }

    pub fn requires_immediate_restart(self) -> bool {
        matches!(
            self,
            ResultCode::SUCCESS_IMMEDIATE_REBOOT_REQUIRED
                | ResultCode::SUCCESS_IMMEDIATE_AGENT_RESTART_REQUIRED
        )
    }
}

/// Extended-code values classifying a failure beyond its range.
///
/// The high byte pins the facility (the agent core); handler modules are free
/// to report their own values, which the core forwards untouched.
pub mod extended_code {
    pub const NONE: u32 = 0;
    pub const BAD_FORMAT: u32 = 0x00A0_0001;
    pub const SIGNATURE_INVALID: u32 = 0x00A0_0002;
    pub const MANIFEST_HASH_MISMATCH: u32 = 0x00A0_0003;
    pub const COMPONENT_SELECTION_FAILED: u32 = 0x00A0_0004;
    pub const HANDLER_LOAD_FAILED: u32 = 0x00A0_0005;
    pub const PHASE_FAILED: u32 = 0x00A0_0006;
    pub const CANCELLED: u32 = 0x00A0_0007;
    pub const UNEXPECTED_STATE: u32 = 0x00A0_0008;
    pub const INTERNAL: u32 = 0x00A0_0009;
}

/// The `(code, extended_code, details)` triple reported at every layer.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub code: ResultCode,
    #[serde(default)]
    pub extended_code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl UpdateResult {
    pub fn success() -> Self {
        UpdateResult {
            code: ResultCode::SUCCESS,
            extended_code: extended_code::NONE,
            details: None,
        }
    }

    pub fn with_code(code: ResultCode) -> Self {
        UpdateResult {
            code,
            extended_code: extended_code::NONE,
            details: None,
        }
    }

    pub fn failure(extended_code: u32, details: impl Into<String>) -> Self {
        UpdateResult {
            code: ResultCode::FAILURE,
            extended_code,
            details: Some(details.into()),
        }
    }

    pub fn cancelled() -> Self {
        UpdateResult {
            code: ResultCode::FAILURE_CANCELLED,
            extended_code: extended_code::CANCELLED,
            details: None,
        }
    }

    pub fn skipped_already_installed() -> Self {
        UpdateResult::with_code(ResultCode::SKIPPED_UPDATE_ALREADY_INSTALLED)
    }

    pub fn skipped_no_matching_components() -> Self {
        UpdateResult::with_code(ResultCode::SKIPPED_NO_MATCHING_COMPONENTS)
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    pub fn is_failure(&self) -> bool {
        self.code.is_failure()
    }
}

impl Default for UpdateResult {
    fn default() -> Self {
        UpdateResult {
            code: ResultCode::IN_PROGRESS,
            extended_code: extended_code::NONE,
            details: None,
        }
    }
}
