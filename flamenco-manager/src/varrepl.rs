//! Variable substitution for task command settings (base spec §4.1 step 5,
//! §9 "Reflection-driven variable substitution").
//!
//! The original walks `cmd.Settings` with reflection and only touches
//! string-typed values; commands here are already a typed mapping
//! ([`SettingValue`]), so substitution is a plain structural recursion that
//! is a no-op on every non-string variant.
//!
//! Variables are referenced in settings strings as `{name}`. This bracket
//! convention isn't spelled out in the distilled spec; see DESIGN.md for why
//! it was chosen.

use crate::config::VariableTable;
use crate::model::task::{Command, SettingValue};

/// Replace every `{name}` occurrence in `value` whose `name` has an entry
/// for `platform` in `table`. Unknown names are left untouched.
pub fn expand_string(value: &str, table: &VariableTable, platform: &str) -> String {
    if !value.contains('{') {
        return value.to_string();
    }
    let mut out = value.to_string();
    for (name, per_platform) in table {
        if let Some(replacement) = per_platform.get(platform) {
            let needle = format!("{{{name}}}");
            out = out.replace(&needle, replacement);
        }
    }
    out
}

fn expand_setting(value: &mut SettingValue, table: &VariableTable, platform: &str) {
    match value {
        SettingValue::Str(s) => *s = expand_string(s, table, platform),
        SettingValue::List(items) => {
            for item in items {
                expand_setting(item, table, platform);
            }
        }
        SettingValue::Map(map) => {
            for value in map.values_mut() {
                expand_setting(value, table, platform);
            }
        }
        SettingValue::Number(_) | SettingValue::Bool(_) => {}
    }
}

/// Applies both the `variables` and `path_replacement` tables to every
/// string-valued setting of every command, for the given worker platform.
pub fn expand_commands(
    commands: &mut [Command],
    variables: &VariableTable,
    path_replacement: &VariableTable,
    platform: &str,
) {
    for command in commands {
        for value in command.settings.values_mut() {
            expand_setting(value, variables, platform);
            expand_setting(value, path_replacement, platform);
        }
    }
}
