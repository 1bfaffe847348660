use clap::ValueEnum;

use crate::device::UsbSignature;

const ROCKCHIP_VID: u16 = 0x2207;

/// Boards whose bootloader (maskrom/loader) mode batchflash knows how to detect
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Board {
    /// Rockchip RK3288
    Rk3288,

    /// Rockchip RK3328 (Rock64, Rock Pi E)
    Rk3328,

    /// Rockchip RK3399 (Rock Pi 4, RockPro64)
    Rk3399,

    /// Rockchip RK3566 (Radxa CM3, Rock 3C)
    Rk3566,

    /// Same USB id as RK3566
    Rk3568,

    /// Rockchip RK3588 (Rock 5)
    Rk3588,

    /// No built-in signature; supply one or more --usb-id
    Custom,
}

/// USB signatures a board exposes while waiting for firmware
pub fn signatures_for_board(board: Board) -> Vec<UsbSignature> {
    let pids: &[u16] = match board {
        Board::Rk3288 => &[0x320a],
        Board::Rk3328 => &[0x320c],
        Board::Rk3399 => &[0x330c],
        Board::Rk3566 | Board::Rk3568 => &[0x350a],
        Board::Rk3588 => &[0x350b],
        Board::Custom => &[],
    };

    pids.iter()
        .map(|pid| UsbSignature::new(ROCKCHIP_VID, *pid))
        .collect()
}

/// The external flashing tool a batch drives and the argument steps it
/// runs against each device
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ToolProfile {
    /// Rockchip `upgrade_tool`
    UpgradeTool,

    /// Open source `rkdeveloptool`
    Rkdeveloptool,
}

impl ToolProfile {
    pub fn default_program(&self) -> &'static str {
        match self {
            ToolProfile::UpgradeTool => "upgrade_tool",
            ToolProfile::Rkdeveloptool => "rkdeveloptool",
        }
    }

    /// Whether the tool can be pointed at one device among several
    /// attached ones. `upgrade_tool` takes `-s <LocationID>`; mainline
    /// `rkdeveloptool` always talks to the first device it finds.
    pub fn selects_device(&self) -> bool {
        matches!(self, ToolProfile::UpgradeTool)
    }

    /// Argument templates, one tool invocation per entry
    pub fn default_steps(&self) -> Vec<Vec<String>> {
        let steps: &[&[&str]] = match self {
            ToolProfile::UpgradeTool => &[
                &["-s", "{location}", "ul", "{loader}", "-noreset"],
                &["-s", "{location}", "wl", "0", "{image}"],
                &["-s", "{location}", "rd"],
            ],
            ToolProfile::Rkdeveloptool => &[
                &["db", "{loader}"],
                &["wl", "0", "{image}"],
                &["rd"],
            ],
        };

        steps
            .iter()
            .map(|step| step.iter().map(|arg| arg.to_string()).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rk3566_and_rk3568_share_maskrom_id() {
        assert_eq!(
            signatures_for_board(Board::Rk3566),
            signatures_for_board(Board::Rk3568)
        );
        assert_eq!(
            signatures_for_board(Board::Rk3588),
            vec![UsbSignature::new(0x2207, 0x350b)]
        );
        assert!(signatures_for_board(Board::Custom).is_empty());
    }

    #[test]
    fn profiles_download_loader_before_image() {
        for profile in [ToolProfile::UpgradeTool, ToolProfile::Rkdeveloptool] {
            let steps = profile.default_steps();
            assert!(steps[0].contains(&"{loader}".to_string()));
            assert!(steps[1].ends_with(&["wl".into(), "0".into(), "{image}".into()]));
        }
    }

    #[test]
    fn upgrade_tool_steps_select_the_slot() {
        let steps = ToolProfile::UpgradeTool.default_steps();
        assert!(steps.iter().all(|step| step[..2] == ["-s", "{location}"]));

        let steps = ToolProfile::Rkdeveloptool.default_steps();
        assert!(!ToolProfile::Rkdeveloptool.selects_device());
        assert!(steps.iter().flatten().all(|arg| !arg.contains("{location}")));
    }
}
