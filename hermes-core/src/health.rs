//! Health monitoring tables: map a classified error to a recovery action.
use serde::{Deserialize, Serialize};

use crate::error::HermesErrorKind;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRecoveryAction {
    Ignore,
    Shutdown,
    ColdRestart,
    WarmRestart,
}

/// Recovery policy applied while a module is being staged.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModuleInitHMTable {
    pub config: ModuleRecoveryAction,
    pub module_spawn: ModuleRecoveryAction,
    pub panic: ModuleRecoveryAction,
}

impl ModuleInitHMTable {
    pub fn action_for(&self, err: HermesErrorKind) -> Option<ModuleRecoveryAction> {
        match err {
            HermesErrorKind::Config => Some(self.config),
            HermesErrorKind::ModuleSpawn => Some(self.module_spawn),
            HermesErrorKind::Panic => Some(self.panic),
            _ => None,
        }
    }
}

impl Default for ModuleInitHMTable {
    fn default() -> Self {
        Self {
            config: ModuleRecoveryAction::Shutdown,
            module_spawn: ModuleRecoveryAction::Shutdown,
            panic: ModuleRecoveryAction::Shutdown,
        }
    }
}

/// Recovery policy applied to errors raised while frames are running.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModuleRunHMTable {
    pub module_crashed: ModuleRecoveryAction,
    pub barrier_timeout: ModuleRecoveryAction,
    pub panic: ModuleRecoveryAction,
}

impl ModuleRunHMTable {
    pub fn action_for(&self, err: HermesErrorKind) -> Option<ModuleRecoveryAction> {
        match err {
            HermesErrorKind::ModuleCrashed => Some(self.module_crashed),
            HermesErrorKind::BarrierTimeout => Some(self.barrier_timeout),
            HermesErrorKind::Panic => Some(self.panic),
            _ => None,
        }
    }
}

impl Default for ModuleRunHMTable {
    fn default() -> Self {
        Self {
            module_crashed: ModuleRecoveryAction::Shutdown,
            barrier_timeout: ModuleRecoveryAction::Shutdown,
            panic: ModuleRecoveryAction::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_shutdown_on_crash() {
        let table = ModuleRunHMTable::default();
        assert_eq!(
            table.action_for(HermesErrorKind::ModuleCrashed),
            Some(ModuleRecoveryAction::Shutdown)
        );
        assert_eq!(table.action_for(HermesErrorKind::UnknownSignal), None);
    }
}
