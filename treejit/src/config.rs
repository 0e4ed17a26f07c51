//! Environment-variable driven configuration, read once per [crate::CodeGen].

use std::env;

use crate::CompilationError;

/// Register-stress testing modes (`TJ_STRESS_REGS`).
///
/// Preference masks handed to the allocator are recommendations, and callers
/// must be able to cope when they are not honored. Stress mode deliberately
/// prefers registers *outside* the recommended masks so such callers fail
/// fast in testing rather than rarely in the field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StressRegs {
    Off,
    /// Invert preference masks when picking.
    PickInverted,
}

#[derive(Debug)]
pub struct Config {
    pub stress_regs: StressRegs,
}

impl Config {
    pub fn from_env() -> Result<Self, CompilationError> {
        let stress_regs = match env::var("TJ_STRESS_REGS") {
            Ok(s) => match s.as_str() {
                "0" => StressRegs::Off,
                "1" => StressRegs::PickInverted,
                _ => {
                    return Err(CompilationError::InternalError(format!(
                        "Invalid TJ_STRESS_REGS value '{s}': expected 0 or 1"
                    )))
                }
            },
            Err(_) => StressRegs::Off,
        };
        Ok(Config { stress_regs })
    }

    /// A configuration with everything off; what the tests use.
    pub fn default_for_tests() -> Self {
        Config {
            stress_regs: StressRegs::Off,
        }
    }
}
