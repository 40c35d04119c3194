use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

use super::VmError;

/// Method groups a token standard may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// transfer, approve, allowance, transfer_from and the read accessors
    Core,
    Kyc,
    Snapshots,
    Dividends,
    CrossChain,
    /// custom_method: registered extension modules
    Modules,
}

/// Token standards known to the execution engine, resolved once at deploy time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStandard {
    Erc20,
    Trc20,
    /// Native security-token standard
    Gndst1,
    Custom,
}

impl TokenStandard {
    pub fn capabilities(&self) -> &'static [Capability] {
        use Capability::*;

        match self {
            TokenStandard::Erc20 | TokenStandard::Trc20 => &[Core],
            TokenStandard::Gndst1 => &[Core, Kyc, Snapshots, Dividends, CrossChain, Modules],
            TokenStandard::Custom => &[Core, Modules],
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStandard::Erc20 => "erc20",
            TokenStandard::Trc20 => "trc20",
            TokenStandard::Gndst1 => "gndst1",
            TokenStandard::Custom => "custom",
        }
    }
}

impl fmt::Display for TokenStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenStandard {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "erc20" => Ok(TokenStandard::Erc20),
            "trc20" => Ok(TokenStandard::Trc20),
            "gndst1" => Ok(TokenStandard::Gndst1),
            "custom" => Ok(TokenStandard::Custom),
            _ => Err(VmError::StandardNotSupported(s.to_string())),
        }
    }
}
