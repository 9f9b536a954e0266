//! Line-level filters shared by both build systems for scrubbing noisy
//! Maven/Gradle console output before it's stored in a result message.

use regex::Regex;
use std::sync::OnceLock;

fn download_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(Download(ing|ed)) from \S+: .+$").unwrap())
}

fn license_block_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[(INFO|WARNING)\]\s*(Unapproved|License)").unwrap())
}

/// Collapses consecutive `Download(ing|ed) from ...` lines into a single
/// summary line.
pub fn merge_download_lines(output: &str) -> String {
    let mut result = Vec::new();
    let mut run = 0usize;
    for line in output.lines() {
        if download_line_re().is_match(line) {
            run += 1;
        } else {
            if run > 0 {
                result.push(format!("[... {run} dependency download line(s) omitted ...]"));
                run = 0;
            }
            result.push(line.to_string());
        }
    }
    if run > 0 {
        result.push(format!("[... {run} dependency download line(s) omitted ...]"));
    }
    result.join("\n")
}

/// Drops license-warning blocks: a line matching the block header and every
/// indented/continuation line after it, until a blank line or unrelated
/// top-level line ends the block.
pub fn merge_unapproved_licences(output: &str) -> String {
    let mut result = Vec::new();
    let mut in_block = false;
    for line in output.lines() {
        if license_block_start_re().is_match(line) {
            in_block = true;
            continue;
        }
        if in_block {
            if line.trim().is_empty() || !line.starts_with(' ') {
                in_block = false;
            } else {
                continue;
            }
        }
        result.push(line.to_string());
    }
    result.join("\n")
}

/// Full cleaning pipeline applied to raw build-tool stdout/stderr before it
/// is recorded in a result message.
pub fn clean_output(output: &str) -> String {
    merge_unapproved_licences(&merge_download_lines(output))
}
