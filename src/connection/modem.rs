//! Supported USB modem variants and hardware probing.
//!
//! A variant is a plain descriptor: how to recognize it before the mode
//! switch, which USB id it reports afterwards, and the `usb_modeswitch`
//! configuration that performs the switch.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{RelayError, Result};

/// Descriptor of one supported modem model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemVariant {
    /// Short identifier; also the name of the mode-switch config file.
    pub uid: &'static str,
    /// `vendor:product` id reported while in mass-storage mode.
    pub vendor_product: &'static str,
    /// `vendor:product` id reported once switched into modem mode.
    pub target_mode: &'static str,
    /// Contents of the `usb_modeswitch` configuration file.
    pub modeswitch: &'static str,
}

pub const E303: ModemVariant = ModemVariant {
    uid: "e303",
    vendor_product: "12d1:1f01",
    target_mode: "12d1:14dc",
    modeswitch: "\
DefaultVendor=0x12d1
DefaultProduct=0x1f01
TargetVendor=0x12d1
TargetProduct=0x14dc
MessageContent=\"55534243123456780000000000000a11062000000000000100000000000000\"
",
};

pub const E353: ModemVariant = ModemVariant {
    uid: "e353",
    vendor_product: "12d1:1f01",
    target_mode: "12d1:1506",
    modeswitch: "\
DefaultVendor=0x12d1
DefaultProduct=0x1f01
TargetVendor=0x12d1
TargetProduct=0x1506
MessageContent=\"55534243123456780000000000000011062000000100000000000000000000\"
",
};

pub const E3131: ModemVariant = ModemVariant {
    uid: "e3131",
    vendor_product: "12d1:155b",
    target_mode: "12d1:1506",
    modeswitch: "\
DefaultVendor=0x12d1
DefaultProduct=0x155b
TargetVendor=0x12d1
TargetProduct=0x1506
MessageContent=\"55534243123456780000000000000011062000000100000000000000000000\"
",
};

/// Supported variants in detection priority order.
pub const SUPPORTED_MODEMS: &[ModemVariant] = &[E303, E353, E3131];

/// Hardware access needed by the connection state machine.
pub trait ModemProbe {
    /// Is this variant attached (in either mode)? `None` asks about any
    /// supported variant.
    fn is_plugged(&self, variant: Option<&ModemVariant>) -> Result<bool>;

    /// Does an attached device currently report `target_mode`?
    fn is_in_mode(&self, target_mode: &str) -> Result<bool>;

    /// Issue the mode-switch command with the given configuration file.
    fn mode_switch(&self, config: &Path) -> Result<()>;
}

/// Probe backed by `lsusb` and `usb_modeswitch`.
#[derive(Debug, Clone)]
pub struct UsbModemProbe {
    lsusb_bin: PathBuf,
    modeswitch_bin: PathBuf,
}

impl UsbModemProbe {
    pub fn new(lsusb_bin: impl Into<PathBuf>, modeswitch_bin: impl Into<PathBuf>) -> Self {
        Self {
            lsusb_bin: lsusb_bin.into(),
            modeswitch_bin: modeswitch_bin.into(),
        }
    }

    /// Run `lsusb` and return the `vendor:product` ids it lists.
    fn usb_ids(&self) -> Result<Vec<String>> {
        let output = Command::new(&self.lsusb_bin)
            .output()
            .map_err(|e| RelayError::io(&self.lsusb_bin, e))?;
        if !output.status.success() {
            return Err(RelayError::Command {
                program: self.lsusb_bin.display().to_string(),
                reason: format!("exited with {}", output.status),
            });
        }
        Ok(parse_usb_ids(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl ModemProbe for UsbModemProbe {
    fn is_plugged(&self, variant: Option<&ModemVariant>) -> Result<bool> {
        let ids = self.usb_ids()?;
        let matches = |v: &ModemVariant| {
            ids.iter()
                .any(|id| id == v.vendor_product || id == v.target_mode)
        };
        Ok(match variant {
            Some(v) => matches(v),
            None => SUPPORTED_MODEMS.iter().any(matches),
        })
    }

    fn is_in_mode(&self, target_mode: &str) -> Result<bool> {
        Ok(self.usb_ids()?.iter().any(|id| id == target_mode))
    }

    fn mode_switch(&self, config: &Path) -> Result<()> {
        debug!(config = %config.display(), "Running usb_modeswitch");
        let status = Command::new(&self.modeswitch_bin)
            .arg("--config-file")
            .arg(config)
            .status()
            .map_err(|e| RelayError::io(&self.modeswitch_bin, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(RelayError::Command {
                program: self.modeswitch_bin.display().to_string(),
                reason: format!("exited with {status}"),
            })
        }
    }
}

/// Extract lowercase `vendor:product` ids from `lsusb` output.
///
/// Lines look like `Bus 001 Device 004: ID 12d1:1f01 Huawei Technologies ...`.
fn parse_usb_ids(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = &line[line.find(" ID ")? + 4..];
            rest.split_whitespace().next()
        })
        .map(str::to_ascii_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usb_ids() {
        let out = "\
Bus 002 Device 001: ID 1d6b:0003 Linux Foundation 3.0 root hub
Bus 001 Device 004: ID 12D1:1F01 Huawei Technologies Co., Ltd. E353/E3131 (Mass storage mode)
garbage line
";
        assert_eq!(parse_usb_ids(out), ["1d6b:0003", "12d1:1f01"]);
    }

    #[test]
    fn test_priority_order() {
        let uids: Vec<&str> = SUPPORTED_MODEMS.iter().map(|m| m.uid).collect();
        assert_eq!(uids, ["e303", "e353", "e3131"]);
    }

    #[test]
    fn test_modeswitch_configs_name_target() {
        for modem in SUPPORTED_MODEMS {
            let product = modem.target_mode.split(':').nth(1).unwrap();
            assert!(modem
                .modeswitch
                .contains(&format!("TargetProduct=0x{product}")));
        }
    }
}
