//! 输出截断：超出字节或行数上限时截断并追加显式标记
//!
//! 先按字节（在不超过上限的字符边界处切断），否则按行。
//! 标记为 `\n... (truncated N more bytes)` / `\n... (truncated N more lines)`，
//! 因此 ASCII 输出按字节截断后长度恰为 `max_bytes + 标记长度`。

use serde::Deserialize;

/// 截断上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    pub max_bytes: usize,
    pub max_lines: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_bytes: 30_000,
            max_lines: 100,
        }
    }
}

pub fn byte_marker(removed: usize) -> String {
    format!("\n... (truncated {removed} more bytes)")
}

pub fn line_marker(removed: usize) -> String {
    format!("\n... (truncated {removed} more lines)")
}

/// 按上限截断；未超限时原样返回
pub fn truncate_output(text: &str, limits: OutputLimits) -> String {
    if text.len() > limits.max_bytes {
        let mut cut = limits.max_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let removed = text.len() - cut;
        let mut out = String::with_capacity(cut + 40);
        out.push_str(&text[..cut]);
        out.push_str(&byte_marker(removed));
        return out;
    }

    let total_lines = text.split_inclusive('\n').count();
    if total_lines > limits.max_lines {
        let kept: String = text
            .split_inclusive('\n')
            .take(limits.max_lines)
            .collect();
        let kept = kept.strip_suffix('\n').unwrap_or(&kept);
        return format!("{kept}{}", line_marker(total_lines - limits.max_lines));
    }

    text.to_string()
}

/// 流式采集的输出：`kept` 至多 `max_bytes` 字节，`dropped` 为读取时已丢弃的字节数，计入标记
pub fn truncate_captured(kept: &[u8], dropped: usize, limits: OutputLimits) -> String {
    if dropped == 0 {
        return truncate_output(&String::from_utf8_lossy(kept), limits);
    }
    // 上限处切断的多字节字符整个算作被截掉
    let end = match std::str::from_utf8(kept) {
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => kept.len(),
    };
    let removed = kept.len() - end + dropped;
    format!("{}{}", String::from_utf8_lossy(&kept[..end]), byte_marker(removed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_limits_unchanged() {
        let limits = OutputLimits {
            max_bytes: 100,
            max_lines: 10,
        };
        assert_eq!(truncate_output("hi\n", limits), "hi\n");
        assert_eq!(truncate_output("", limits), "");
    }

    #[test]
    fn test_byte_truncation_length() {
        let limits = OutputLimits {
            max_bytes: 64,
            max_lines: 10_000,
        };
        let text = "x".repeat(1000);
        let out = truncate_output(&text, limits);
        let marker = byte_marker(1000 - 64);
        assert!(out.ends_with(&marker));
        assert_eq!(out.len(), 64 + marker.len());
    }

    #[test]
    fn test_byte_truncation_respects_char_boundary() {
        let limits = OutputLimits {
            max_bytes: 5,
            max_lines: 100,
        };
        // 每个字符 3 字节：5 字节处不是字符边界，退到 3
        let out = truncate_output("日本語です", limits);
        assert!(out.starts_with("日"));
        assert!(out.ends_with("(truncated 12 more bytes)"));
    }

    #[test]
    fn test_captured_counts_dropped_bytes() {
        let limits = OutputLimits {
            max_bytes: 4,
            max_lines: 100,
        };
        assert_eq!(truncate_captured(b"abcd", 96, limits), format!("abcd{}", byte_marker(96)));
        // "日" 的前两个字节落在上限内
        let kept = [b'a', b'b', 0xe6, 0x97];
        assert_eq!(truncate_captured(&kept, 1, limits), format!("ab{}", byte_marker(3)));
        let lines = OutputLimits {
            max_bytes: 100,
            max_lines: 2,
        };
        assert_eq!(
            truncate_captured(b"a\nb\nc\n", 0, lines),
            "a\nb\n... (truncated 1 more lines)"
        );
    }

    #[test]
    fn test_line_truncation() {
        let limits = OutputLimits {
            max_bytes: 10_000,
            max_lines: 2,
        };
        let out = truncate_output("a\nb\nc\nd\n", limits);
        assert_eq!(out, "a\nb\n... (truncated 2 more lines)");
    }
}
