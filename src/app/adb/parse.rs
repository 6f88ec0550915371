use regex::Regex;
use std::collections::HashMap;

use crate::app::models::{BatteryInfo, DeviceRecord, DeviceState};

/// Parses the bridge tool's device list. Accepts any line with at least
/// two whitespace-separated tokens that is not the header or a daemon
/// banner; callers decide what to do with non-ready states.
pub fn parse_device_list(output: &str) -> Vec<DeviceRecord> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let mut record = DeviceRecord::new(tokens[0], DeviceState::from_token(tokens[1]));
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    record.model = value.to_string();
                } else if let Some(value) = token.strip_prefix("manufacturer:") {
                    record.manufacturer = value.to_string();
                }
            }
            Some(record)
        })
        .collect()
}

/// Parses `getprop` output into a property map. Lines look like
/// `[ro.product.model]: [Pixel 7]`.
pub fn parse_build_properties(output: &str) -> HashMap<String, String> {
    let re = Regex::new(r"\[([^\]]+)\]:\s*\[([^\]]*)\]").expect("static getprop pattern");
    let mut props = HashMap::new();
    for line in output.lines() {
        if let Some(caps) = re.captures(line.trim()) {
            let key = caps[1].trim().to_string();
            if !key.is_empty() {
                props.insert(key, caps[2].trim().to_string());
            }
        }
    }
    props
}

/// Extracts level and status from `dumpsys battery` output.
pub fn parse_battery_info(output: &str) -> BatteryInfo {
    let mut info = BatteryInfo::default();
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("level:") {
            if let Ok(level) = value.trim().parse::<u8>() {
                info.level = Some(level);
            }
        } else if let Some(value) = trimmed.strip_prefix("status:") {
            let value = value.trim();
            if !value.is_empty() {
                info.status = Some(value.to_string());
            }
        }
    }
    info
}

/// Parses `pm list packages` output into bare package names.
pub fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::UNKNOWN;

    #[test]
    fn parses_device_list_with_properties() {
        let output = "List of devices attached\n\
                      0123456789ABCDEF device product:sdk_gphone64_arm64 model:Pixel_7 manufacturer:Google\n\
                      emulator-5556 unauthorized transport_id:2\n";
        let records = parse_device_list(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].serial, "0123456789ABCDEF");
        assert_eq!(records[0].state, DeviceState::Online);
        assert_eq!(records[0].model, "Pixel_7");
        assert_eq!(records[0].manufacturer, "Google");
        assert!(records[0].connected);
        assert_eq!(records[1].state, DeviceState::Unauthorized);
        assert!(!records[1].connected);
    }

    #[test]
    fn ready_device_with_model_and_manufacturer_tokens() {
        // Shape reported for an emulator attached over the bridge tool.
        let output = "emulator-5554  device model:Pixel_5 manufacturer:Google\n";
        let records = parse_device_list(output);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.serial, "emulator-5554");
        assert_eq!(record.state, DeviceState::Online);
        assert_eq!(record.model, "Pixel_5");
        assert_eq!(record.manufacturer, "Google");
        assert!(record.connected);
    }

    #[test]
    fn missing_tokens_default_to_unknown() {
        let records = parse_device_list("SERIAL123 device\n");
        assert_eq!(records[0].model, UNKNOWN);
        assert_eq!(records[0].manufacturer, UNKNOWN);
        assert_eq!(records[0].android_version, UNKNOWN);
    }

    #[test]
    fn skips_header_banner_and_short_lines() {
        let output = "* daemon not running; starting now at tcp:5037\n\
                      * daemon started successfully\n\
                      List of devices attached\n\
                      loneword\n\
                      \n";
        assert!(parse_device_list(output).is_empty());
    }

    #[test]
    fn parses_build_properties() {
        let output = "[ro.product.manufacturer]: [Google]\n\
                      [ro.product.model]: [Pixel 7]\n\
                      [ro.build.version.release]: [14]\n\
                      not a property line\n";
        let props = parse_build_properties(output);
        assert_eq!(props.get("ro.product.model").map(String::as_str), Some("Pixel 7"));
        assert_eq!(
            props.get("ro.build.version.release").map(String::as_str),
            Some("14")
        );
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn parses_battery_info() {
        let output = "Current Battery Service state:\n  AC powered: false\n  level: 87\n  status: 2\n";
        let info = parse_battery_info(output);
        assert_eq!(info.level, Some(87));
        assert_eq!(info.status.as_deref(), Some("2"));
    }

    #[test]
    fn parses_package_list() {
        let output = "package:com.example.alpha\npackage:com.example.beta\n\nnoise\n";
        let packages = parse_package_list(output);
        assert_eq!(packages, vec!["com.example.alpha", "com.example.beta"]);
    }
}
