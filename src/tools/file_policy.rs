//! 文件访问策略
//!
//! 默认把文件工具限制在会话工作目录内：路径先按词法规范化（去掉 `.`、折叠 `..`），
//! 已存在的路径再解析符号链接后复查。可选的正则允许/拒绝列表作用于规范化后的完整路径，大小写不敏感。

use std::path::{Component, Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::tools::PolicyDecision;

/// 声明式文件策略（对应配置 `[tools.file]`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileAccessPolicy {
    /// 路径必须位于工作目录内
    pub confine_to_workdir: bool,
    /// 非空时路径必须匹配其中之一
    pub allowed_patterns: Vec<String>,
    /// 优先于允许列表
    pub denied_patterns: Vec<String>,
}

impl Default for FileAccessPolicy {
    fn default() -> Self {
        Self {
            confine_to_workdir: true,
            allowed_patterns: Vec::new(),
            denied_patterns: vec![r"(^|/)\.git/".into()],
        }
    }
}

/// 编译后的策略
#[derive(Debug, Clone)]
pub struct FileAccess {
    confine_to_workdir: bool,
    allowed: Vec<Regex>,
    denied: Vec<Regex>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
        .collect()
}

impl FileAccess {
    pub fn new(policy: &FileAccessPolicy) -> Result<Self, regex::Error> {
        Ok(Self {
            confine_to_workdir: policy.confine_to_workdir,
            allowed: compile(&policy.allowed_patterns)?,
            denied: compile(&policy.denied_patterns)?,
        })
    }

    /// `path` 须已由 [`resolve_path`] 解析
    pub fn check(&self, workdir: &Path, path: &Path) -> PolicyDecision {
        if self.confine_to_workdir && !within(workdir, path) {
            return PolicyDecision::Denied {
                reason: format!(
                    "path {} is outside the working directory {}",
                    path.display(),
                    workdir.display()
                ),
            };
        }
        let text = path.to_string_lossy();
        if let Some(p) = self.denied.iter().find(|p| p.is_match(&text)) {
            return PolicyDecision::Denied {
                reason: format!("path {text} matches denied pattern '{}'", p.as_str()),
            };
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|p| p.is_match(&text)) {
            return PolicyDecision::Denied {
                reason: format!("path {text} does not match any allowed pattern"),
            };
        }
        PolicyDecision::Allowed
    }
}

/// 相对路径接到工作目录下，再按词法规范化；不访问文件系统
pub fn resolve_path(workdir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        workdir.join(p)
    };
    normalize(&joined)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // 根目录之上仍是根目录
                if !out.pop() && !out.has_root() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// 词法上位于工作目录内；已存在的部分再按真实路径复查，防止符号链接逃逸
fn within(workdir: &Path, path: &Path) -> bool {
    let workdir = normalize(workdir);
    if !path.starts_with(&workdir) {
        return false;
    }
    let Some(existing) = path.ancestors().find(|a| a.exists()) else {
        return true;
    };
    match (existing.canonicalize(), workdir.canonicalize()) {
        (Ok(real), Ok(root)) => real.starts_with(root),
        _ => true,
    }
}
