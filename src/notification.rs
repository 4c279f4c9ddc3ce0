//! Desktop notifications for problems the user has to fix.

use std::process::Command;

pub fn notify(title: &str, message: &str) {
    let result = if cfg!(target_os = "macos") {
        let script = format!(
            "display notification \"{}\" with title \"{}\"",
            escape_applescript_string(message),
            escape_applescript_string(title)
        );
        Command::new("osascript").arg("-e").arg(&script).output()
    } else {
        Command::new("notify-send").arg(title).arg(message).output()
    };

    match result {
        Ok(output) if output.status.success() => {}
        Ok(output) => tracing::error!(
            "Notification failed ({}): {}: {}",
            output.status,
            title,
            message
        ),
        Err(e) => tracing::error!("Failed to send notification ({}): {}: {}", e, title, message),
    }
}

/// Report a validation failure to the user.
pub fn notify_invalid(what: &str, error: &crate::error::MacroError) {
    tracing::warn!("{} rejected: {}", what, error);
    notify("tickmacro", &format!("{}: {}", what, error));
}

fn escape_applescript_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_quotes_and_backslashes() {
        assert_eq!(escape_applescript_string(r#"say "hi" \o/"#), r#"say \"hi\" \\o/"#);
    }
}
