use crate::app::models::BootloaderDevice;

/// Parses the bootloader tool's device list: `<serial>\t<state>` lines,
/// no header.
pub fn parse_bootloader_devices(output: &str) -> Vec<BootloaderDevice> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            Some(BootloaderDevice {
                serial: tokens[0].to_string(),
                state: tokens[1].to_string(),
            })
        })
        .collect()
}

/// Extracts one `getvar` answer. The tool prints `<var>: <value>`,
/// usually on stderr, followed by a `Finished.` trailer.
pub fn parse_getvar_value(output: &str, var: &str) -> Option<String> {
    let prefix = format!("{var}:");
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix(&prefix) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_lines() {
        let output = "0123456789ABCDEF\tfastboot\nemulator-5554\tfastboot\n";
        let devices = parse_bootloader_devices(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial, "0123456789ABCDEF");
        assert_eq!(devices[0].state, "fastboot");
    }

    #[test]
    fn skips_blank_and_short_lines() {
        let output = "\n  \nlonetoken\nSERIAL fastboot\n";
        let devices = parse_bootloader_devices(output);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "SERIAL");
    }

    #[test]
    fn extracts_getvar_values() {
        let output = "product: blueline\nFinished. Total time: 0.001s\n";
        assert_eq!(
            parse_getvar_value(output, "product").as_deref(),
            Some("blueline")
        );
        assert_eq!(parse_getvar_value(output, "serialno"), None);
    }
}
