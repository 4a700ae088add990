//! 命令白名单校验
//!
//! 两部分，互相独立、可单独测试：
//! - `split_commands`：按 shell 语法把命令行拆成若干简单命令（处理引号、管道、`&&`/`||`/`;`、子 shell、
//!   重定向、heredoc），`$(...)`、反引号、`<(...)` 中的内容递归拆分，算术展开与未加引号的 heredoc 正文里的
//!   命令替换同样拆出；
//! - `CommandValidator`：声明式策略（允许的命令前缀、带原因的拒绝前缀、参数正则黑名单、最大长度），
//!   外加 sort / uniq / awk 的参数级检查。
//!
//! 校验不通过的命令永远不会到达进程执行。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 一个简单命令：去引号后的单词序列（重定向目标、heredoc 正文不在其中）
pub type SimpleCommand = Vec<String>;

/// 校验结论，随工具调用一起写入轨迹
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allowed,
    Denied { reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }
}

const MAX_NESTING: usize = 16;

/// 拆分命令行；语法不完整（引号/括号不配对、重定向缺目标等）时返回 Err
pub fn split_commands(input: &str) -> Result<Vec<SimpleCommand>, String> {
    split_nested(input, 0)
}

fn split_nested(input: &str, nesting: usize) -> Result<Vec<SimpleCommand>, String> {
    if nesting > MAX_NESTING {
        return Err("command substitution nested too deeply".to_string());
    }
    let mut parser = Parser::new(input, nesting);
    parser.run()?;
    Ok(parser.commands)
}

/// 只找展开（`$(...)`、`$((...))`、反引号），引号不起作用：算术体和未加引号的 heredoc 正文都按此处理
fn scan_expansions(text: &str, nesting: usize) -> Result<Vec<SimpleCommand>, String> {
    if nesting > MAX_NESTING {
        return Err("command substitution nested too deeply".to_string());
    }
    let mut parser = Parser::new(text, nesting);
    while let Some(c) = parser.bump() {
        match c {
            '\\' => {
                parser.bump();
            }
            '$' if parser.peek() == Some('(') => parser.dollar_paren()?,
            '`' => {
                let inner = parser.take_backtick()?;
                parser.nested(&inner)?;
            }
            _ => {}
        }
    }
    Ok(parser.commands)
}

struct PendingHeredoc {
    delim: String,
    /// `<<-`
    strip_tabs: bool,
    /// 定界符未加引号时正文会做命令替换
    expands: bool,
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    nesting: usize,
    commands: Vec<SimpleCommand>,
    current: SimpleCommand,
    word: String,
    /// 已开始一个单词（区分 `""` 与无单词）
    in_word: bool,
    /// 当前单词含引号或转义
    word_quoted: bool,
    /// 下一个单词是重定向目标
    skip_next_word: bool,
    /// 下一个单词是 heredoc 定界符（值为是否 `<<-`）
    heredoc_delim: Option<bool>,
    pending_heredocs: Vec<PendingHeredoc>,
    subshell_depth: usize,
}

impl Parser {
    fn new(input: &str, nesting: usize) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            nesting,
            commands: Vec::new(),
            current: Vec::new(),
            word: String::new(),
            in_word: false,
            word_quoted: false,
            skip_next_word: false,
            heredoc_delim: None,
            pending_heredocs: Vec::new(),
            subshell_depth: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn push_char(&mut self, c: char) {
        self.in_word = true;
        self.word.push(c);
    }

    fn push_str(&mut self, s: &str) {
        self.in_word = true;
        self.word.push_str(s);
    }

    fn run(&mut self) -> Result<(), String> {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                    self.end_word();
                }
                '\n' => {
                    self.bump();
                    self.end_command()?;
                    self.skip_heredoc_bodies()?;
                }
                '#' if !self.in_word => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some('\n') => {}
                        Some(ch) => {
                            self.word_quoted = true;
                            self.push_char(ch);
                        }
                        None => self.push_char('\\'),
                    }
                }
                '\'' => {
                    self.bump();
                    self.in_word = true;
                    self.word_quoted = true;
                    loop {
                        match self.bump() {
                            Some('\'') => break,
                            Some(ch) => self.word.push(ch),
                            None => return Err("unterminated single quote".to_string()),
                        }
                    }
                }
                '"' => {
                    self.bump();
                    self.in_word = true;
                    self.word_quoted = true;
                    self.double_quoted()?;
                }
                '`' => {
                    self.bump();
                    let inner = self.take_backtick()?;
                    self.nested(&inner)?;
                    self.push_str(&format!("`{inner}`"));
                }
                '$' if self.peek_at(1) == Some('(') => {
                    self.bump();
                    self.dollar_paren()?;
                }
                '|' => {
                    self.bump();
                    if matches!(self.peek(), Some('|') | Some('&')) {
                        self.bump();
                    }
                    self.end_command()?;
                }
                '&' => match self.peek_at(1) {
                    Some('&') => {
                        self.pos += 2;
                        self.end_command()?;
                    }
                    Some('>') => {
                        self.end_word();
                        self.pos += 2;
                        if self.peek() == Some('>') {
                            self.bump();
                        }
                        self.skip_next_word = true;
                    }
                    _ => {
                        self.bump();
                        self.end_command()?;
                    }
                },
                ';' => {
                    self.bump();
                    if matches!(self.peek(), Some(';') | Some('&')) {
                        self.bump();
                    }
                    self.end_command()?;
                }
                '(' => {
                    if self.in_word || !self.current.is_empty() {
                        return Err("unexpected '('".to_string());
                    }
                    self.bump();
                    self.subshell_depth += 1;
                }
                ')' => {
                    if self.subshell_depth == 0 {
                        return Err("unbalanced ')'".to_string());
                    }
                    self.bump();
                    self.subshell_depth -= 1;
                    self.end_command()?;
                }
                '<' | '>' => self.redirect()?,
                _ => {
                    self.bump();
                    self.push_char(c);
                }
            }
        }
        self.end_command()?;
        if self.subshell_depth > 0 {
            return Err("unbalanced '('".to_string());
        }
        if self.heredoc_delim.is_some() {
            return Err("missing heredoc delimiter".to_string());
        }
        if !self.pending_heredocs.is_empty() {
            return Err("unterminated heredoc".to_string());
        }
        Ok(())
    }

    fn end_word(&mut self) {
        if !self.in_word && self.word.is_empty() {
            return;
        }
        let word = std::mem::take(&mut self.word);
        let quoted = std::mem::take(&mut self.word_quoted);
        self.in_word = false;
        if let Some(strip_tabs) = self.heredoc_delim.take() {
            self.pending_heredocs.push(PendingHeredoc {
                delim: word,
                strip_tabs,
                expands: !quoted,
            });
            return;
        }
        if self.skip_next_word {
            self.skip_next_word = false;
            return;
        }
        self.current.push(word);
    }

    fn end_command(&mut self) -> Result<(), String> {
        self.end_word();
        if self.skip_next_word {
            return Err("redirect without a target".to_string());
        }
        if self.heredoc_delim.is_some() {
            return Err("missing heredoc delimiter".to_string());
        }
        if !self.current.is_empty() {
            self.commands.push(std::mem::take(&mut self.current));
        }
        Ok(())
    }

    fn nested(&mut self, inner: &str) -> Result<(), String> {
        let cmds = split_nested(inner, self.nesting + 1)?;
        self.commands.extend(cmds);
        Ok(())
    }

    /// 已消费 `$`，当前位于 `(`；算术体里的命令替换同样会执行
    fn dollar_paren(&mut self) -> Result<(), String> {
        let arithmetic = self.peek_at(1) == Some('(');
        let inner = self.take_balanced()?;
        if arithmetic {
            let cmds = scan_expansions(&inner, self.nesting + 1)?;
            self.commands.extend(cmds);
        } else {
            self.nested(&inner)?;
        }
        self.push_str(&format!("$({inner})"));
        Ok(())
    }

    fn double_quoted(&mut self) -> Result<(), String> {
        loop {
            match self.bump() {
                Some('"') => return Ok(()),
                Some('\\') => match self.bump() {
                    Some('\n') => {}
                    Some(ch @ ('"' | '\\' | '$' | '`')) => self.word.push(ch),
                    Some(ch) => {
                        self.word.push('\\');
                        self.word.push(ch);
                    }
                    None => return Err("unterminated double quote".to_string()),
                },
                Some('$') if self.peek() == Some('(') => self.dollar_paren()?,
                Some('`') => {
                    let inner = self.take_backtick()?;
                    self.nested(&inner)?;
                    self.word.push_str(&format!("`{inner}`"));
                }
                Some(ch) => self.word.push(ch),
                None => return Err("unterminated double quote".to_string()),
            }
        }
    }

    /// 当前位于 `(`：消费到配对的 `)`，返回中间内容（跳过引号内的括号）
    fn take_balanced(&mut self) -> Result<String, String> {
        self.bump();
        let start = self.pos;
        let mut depth = 1usize;
        while let Some(c) = self.bump() {
            match c {
                '\\' => {
                    self.bump();
                }
                '\'' => loop {
                    match self.bump() {
                        Some('\'') => break,
                        Some(_) => {}
                        None => return Err("unterminated single quote".to_string()),
                    }
                },
                '"' => loop {
                    match self.bump() {
                        Some('"') => break,
                        Some('\\') => {
                            self.bump();
                        }
                        Some(_) => {}
                        None => return Err("unterminated double quote".to_string()),
                    }
                },
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(self.chars[start..self.pos - 1].iter().collect());
                    }
                }
                _ => {}
            }
        }
        Err("unbalanced '('".to_string())
    }

    /// 已消费起始反引号：读到下一个未转义的反引号
    fn take_backtick(&mut self) -> Result<String, String> {
        let mut inner = String::new();
        loop {
            match self.bump() {
                Some('`') => return Ok(inner),
                Some('\\') => match self.bump() {
                    Some(ch @ ('`' | '\\' | '$')) => inner.push(ch),
                    Some(ch) => {
                        inner.push('\\');
                        inner.push(ch);
                    }
                    None => return Err("unterminated backtick".to_string()),
                },
                Some(ch) => inner.push(ch),
                None => return Err("unterminated backtick".to_string()),
            }
        }
    }

    fn redirect(&mut self) -> Result<(), String> {
        // `2>` 之类的 fd 前缀不是参数
        if self.in_word && !self.word.is_empty() && self.word.chars().all(|c| c.is_ascii_digit()) {
            self.word.clear();
            self.in_word = false;
        } else {
            self.end_word();
        }
        let first = self.bump().unwrap_or('>');

        // 进程替换 <(...) / >(...) 是参数
        if self.peek() == Some('(') {
            let inner = self.take_balanced()?;
            self.nested(&inner)?;
            self.push_str(&format!("{first}({inner})"));
            return Ok(());
        }

        if first == '<' {
            match self.peek() {
                Some('<') => {
                    self.bump();
                    if self.peek() == Some('<') {
                        // here-string：下一个单词是字符串
                        self.bump();
                        self.skip_next_word = true;
                    } else {
                        let strip_tabs = self.peek() == Some('-');
                        if strip_tabs {
                            self.bump();
                        }
                        self.heredoc_delim = Some(strip_tabs);
                    }
                    return Ok(());
                }
                Some('&') => {
                    self.bump();
                    return self.fd_duplicate();
                }
                Some('>') => {
                    self.bump();
                }
                _ => {}
            }
        } else {
            match self.peek() {
                Some('>') | Some('|') => {
                    self.bump();
                }
                Some('&') => {
                    self.bump();
                    return self.fd_duplicate();
                }
                _ => {}
            }
        }
        self.skip_next_word = true;
        Ok(())
    }

    /// `>&2`、`<&0`、`>&-`：复制 fd，无目标文件；`>&file` 视为普通重定向
    fn fd_duplicate(&mut self) -> Result<(), String> {
        let mut consumed = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '-' {
                self.bump();
                consumed = true;
            } else {
                break;
            }
        }
        if !consumed {
            self.skip_next_word = true;
        }
        Ok(())
    }

    /// 换行之后：消费所有挂起的 heredoc 正文；定界符未加引号时校验正文中的命令替换
    fn skip_heredoc_bodies(&mut self) -> Result<(), String> {
        let pending = std::mem::take(&mut self.pending_heredocs);
        for heredoc in pending {
            let mut body = String::new();
            loop {
                if self.peek().is_none() {
                    return Err(format!("unterminated heredoc (expected '{}')", heredoc.delim));
                }
                let mut line = String::new();
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                    line.push(c);
                }
                let line = if heredoc.strip_tabs {
                    line.trim_start_matches('\t')
                } else {
                    line.as_str()
                };
                if line == heredoc.delim {
                    break;
                }
                body.push_str(line);
                body.push('\n');
            }
            if heredoc.expands {
                let cmds = scan_expansions(&body, self.nesting + 1)?;
                self.commands.extend(cmds);
            }
        }
        Ok(())
    }
}

/// 位于命令前、本身不是命令的保留字
const LEADING_KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "do", "while", "until", "!", "{", "time",
];
/// 单独出现时没有要执行的命令
const CLOSING_KEYWORDS: &[&str] = &["fi", "done", "esac", "}"];
/// 这些结构的单词是变量名或取值列表，不是命令
const LIST_KEYWORDS: &[&str] = &["for", "select"];

fn is_assignment(word: &str) -> bool {
    let Some((name, _)) = word.split_once('=') else {
        return false;
    };
    let name = name.strip_suffix('+').unwrap_or(name);
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 去掉前导保留字与环境变量赋值后的实际命令单词；无实际命令时返回 None
fn effective_words(words: &[String]) -> Option<&[String]> {
    let start = words
        .iter()
        .position(|w| !LEADING_KEYWORDS.contains(&w.as_str()) && !is_assignment(w))?;
    let rest = &words[start..];
    let head = rest[0].as_str();
    if LIST_KEYWORDS.contains(&head) || (CLOSING_KEYWORDS.contains(&head) && rest.len() == 1) {
        return None;
    }
    Some(rest)
}

/// 拒绝规则：命令前缀 + 原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub prefix: String,
    pub reason: String,
}

/// 声明式命令策略（对应配置 `[tools.shell]`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPolicy {
    /// 允许的命令前缀：`git status` 允许 `git status -s`，但不允许 `git push`
    pub allowed_commands: Vec<String>,
    /// 优先于白名单检查的拒绝前缀
    pub denied_commands: Vec<DenyRule>,
    /// 对每个简单命令（单词以空格连接）匹配的正则
    pub denied_arg_patterns: Vec<String>,
    /// 命令行最大字节数
    pub max_command_length: usize,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        let allowed = [
            "pwd", "ls", "cat", "head", "tail", "wc", "stat", "du", "df", "cp", "mv", "mkdir",
            "rmdir", "touch", "find", "grep", "sed", "awk", "cut", "sort", "uniq", "tr", "xargs",
            "tar", "gzip", "git", "python3", "echo", "diff", "true", "false", "test",
        ];
        Self {
            allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
            denied_commands: vec![
                DenyRule {
                    prefix: "rm -rf".into(),
                    reason: "recursive forced deletion".into(),
                },
                DenyRule {
                    prefix: "git push".into(),
                    reason: "publishing changes is left to the caller".into(),
                },
            ],
            denied_arg_patterns: vec![
                r"^find\b.*\s-(exec|execdir|ok|okdir|delete)\b".into(),
                r"^xargs\b.*\b(rm|sh|bash|sudo)\b".into(),
                r"--no-verify\b".into(),
                r"^git\s+.*--force\b".into(),
            ],
            max_command_length: 4096,
        }
    }
}

/// 编译后的策略
#[derive(Debug, Clone)]
pub struct CommandValidator {
    allowed: Vec<Vec<String>>,
    denied: Vec<(Vec<String>, DenyRule)>,
    patterns: Vec<Regex>,
    max_command_length: usize,
}

fn prefix_tokens(prefix: &str) -> Vec<String> {
    prefix.split_whitespace().map(str::to_string).collect()
}

fn prefix_matches(prefix: &[String], words: &[String]) -> bool {
    !prefix.is_empty() && prefix.len() <= words.len() && prefix.iter().zip(words).all(|(p, w)| p == w)
}

impl CommandValidator {
    pub fn new(policy: &CommandPolicy) -> Result<Self, regex::Error> {
        let patterns = policy
            .denied_arg_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allowed: policy.allowed_commands.iter().map(|p| prefix_tokens(p)).collect(),
            denied: policy
                .denied_commands
                .iter()
                .map(|r| (prefix_tokens(&r.prefix), r.clone()))
                .collect(),
            patterns,
            max_command_length: policy.max_command_length,
        })
    }

    /// 校验完整命令行：任一简单命令不通过则整体拒绝
    pub fn validate(&self, command: &str) -> PolicyDecision {
        let command = command.trim();
        if command.is_empty() {
            return PolicyDecision::denied("empty command");
        }
        if command.len() > self.max_command_length {
            return PolicyDecision::denied(format!(
                "command length {} exceeds maximum {}",
                command.len(),
                self.max_command_length
            ));
        }
        let commands = match split_commands(command) {
            Ok(c) => c,
            Err(e) => return PolicyDecision::denied(format!("unparseable command: {e}")),
        };
        for words in &commands {
            if let Some(words) = effective_words(words) {
                let decision = self.check_simple(words);
                if !decision.is_allowed() {
                    return decision;
                }
            }
        }
        PolicyDecision::Allowed
    }

    fn check_simple(&self, words: &[String]) -> PolicyDecision {
        for (prefix, rule) in &self.denied {
            if prefix_matches(prefix, words) {
                return PolicyDecision::denied(format!("'{}' is denied: {}", rule.prefix, rule.reason));
            }
        }
        let joined = words.join(" ");
        for pattern in &self.patterns {
            if pattern.is_match(&joined) {
                return PolicyDecision::denied(format!(
                    "argument pattern '{}' is not allowed",
                    pattern.as_str()
                ));
            }
        }
        if !self.allowed.iter().any(|p| prefix_matches(p, words)) {
            return PolicyDecision::denied(format!("command '{}' is not in the allowlist", words[0]));
        }
        match argument_violation(words) {
            Some(reason) => PolicyDecision::denied(reason),
            None => PolicyDecision::Allowed,
        }
    }
}

/// 拆出的参数：选项名（长选项不含 `=value`，短选项簇逐个展开）与位置参数
struct PosixArgs<'a> {
    options: Vec<String>,
    positional: Vec<&'a str>,
}

/// 按 POSIX/GNU 约定解析参数；`with_value` 中的选项会吃掉取值（同一单词剩余部分或下一个单词）
fn posix_args<'a>(args: &'a [String], with_value: &[&str]) -> PosixArgs<'a> {
    let mut parsed = PosixArgs {
        options: Vec::new(),
        positional: Vec::new(),
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let arg = arg.as_str();
        if arg == "--" {
            parsed.positional.extend(iter.map(String::as_str));
            break;
        }
        if let Some(long) = arg.strip_prefix("--") {
            match long.split_once('=') {
                Some((name, _)) => parsed.options.push(format!("--{name}")),
                None => {
                    parsed.options.push(arg.to_string());
                    if with_value.contains(&arg) {
                        iter.next();
                    }
                }
            }
        } else if arg.len() > 1 && arg.starts_with('-') {
            for (i, c) in arg.char_indices().skip(1) {
                let option = format!("-{c}");
                let takes_value = with_value.contains(&option.as_str());
                parsed.options.push(option);
                if takes_value {
                    if i + c.len_utf8() == arg.len() {
                        iter.next();
                    }
                    break;
                }
            }
        } else {
            parsed.positional.push(arg);
        }
    }
    parsed
}

/// `--out` 之类的 GNU 长选项缩写
fn is_long_abbrev(option: &str, full: &str) -> bool {
    option.len() > 3 && full.starts_with(option)
}

fn awk_program_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"\bsystem\s*\(", r"\|\s*getline\b", r"\|&", r"\bprintf?\b[^;}]*\|"]
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// 白名单里的只读命令中，某些参数组合会写文件或启动子进程
fn argument_violation(words: &[String]) -> Option<String> {
    let args = &words[1..];
    match words[0].as_str() {
        "sort" => {
            let parsed = posix_args(
                args,
                &[
                    "--random-source", "--sort", "--batch-size", "--compress-program",
                    "--files0-from", "-k", "--key", "-o", "--output", "-S", "--buffer-size",
                    "-t", "--field-separator", "-T", "--temporary-directory", "--parallel",
                ],
            );
            parsed
                .options
                .iter()
                .find(|o| {
                    o.as_str() == "-o"
                        || is_long_abbrev(o, "--output")
                        || is_long_abbrev(o, "--compress-program")
                })
                .map(|o| format!("'sort {o}' writes to a file"))
        }
        "uniq" => {
            let parsed = posix_args(
                args,
                &["-f", "--skip-fields", "-s", "--skip-chars", "-w", "--check-chars"],
            );
            (parsed.positional.len() > 1)
                .then(|| "'uniq' with an output file argument is not allowed".to_string())
        }
        "awk" => {
            let parsed = posix_args(args, &["-F", "-v", "-f", "--file", "--assign", "--field-separator"]);
            if let Some(o) = parsed
                .options
                .iter()
                .find(|o| o.as_str() == "-f" || is_long_abbrev(o, "--file"))
            {
                return Some(format!("'awk {o}' loads a program that cannot be inspected"));
            }
            let program = parsed.positional.first()?;
            awk_program_patterns()
                .iter()
                .find(|p| p.is_match(program))
                .map(|p| format!("awk program matches '{}' (runs commands or pipes)", p.as_str()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(input: &str) -> Vec<String> {
        split_commands(input)
            .unwrap()
            .into_iter()
            .map(|c| c[0].clone())
            .collect()
    }

    fn validator() -> CommandValidator {
        CommandValidator::new(&CommandPolicy::default()).unwrap()
    }

    #[test]
    fn test_split_operators() {
        assert_eq!(names("ls -la | grep foo && wc -l; echo done"), vec!["ls", "grep", "wc", "echo"]);
        assert_eq!(names("true || false & pwd"), vec!["true", "false", "pwd"]);
        assert_eq!(names("(cd src; ls)"), vec!["cd", "ls"]);
    }

    #[test]
    fn test_split_quotes_are_single_words() {
        let cmds = split_commands(r#"grep "a | b; c" 'x && y' file"#).unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0], vec!["grep", "a | b; c", "x && y", "file"]);
    }

    #[test]
    fn test_split_redirect_targets_are_not_commands() {
        let cmds = split_commands("echo hi > out.txt 2>&1").unwrap();
        assert_eq!(cmds, vec![vec!["echo".to_string(), "hi".to_string()]]);
        let cmds = split_commands("sort < input.txt >> sorted.txt").unwrap();
        assert_eq!(cmds, vec![vec!["sort".to_string()]]);
    }

    #[test]
    fn test_split_substitutions_recurse() {
        assert_eq!(names("echo $(rm -rf /)"), vec!["rm", "echo"]);
        assert_eq!(names("echo `whoami`"), vec!["whoami", "echo"]);
        assert_eq!(names(r#"echo "today is $(date)""#), vec!["date", "echo"]);
        assert_eq!(names("diff <(ls a) <(ls b)"), vec!["ls", "ls", "diff"]);
        // 算术展开不是命令，但其中的命令替换是
        assert_eq!(names("echo $((1 + 2))"), vec!["echo"]);
        assert_eq!(names("echo $(( $(id -u) + `nproc` ))"), vec!["id", "nproc", "echo"]);
        assert_eq!(names(r#"echo "$(( $(whoami | wc -c) ))""#), vec!["whoami", "wc", "echo"]);
    }

    #[test]
    fn test_split_unquoted_heredoc_expands() {
        assert_eq!(names("cat <<EOF\n$(whoami)\nEOF"), vec!["cat", "whoami"]);
        assert_eq!(names("cat <<-EOF\n\t`id`\n\tEOF"), vec!["cat", "id"]);
        // 正文中的单引号不会阻止展开
        assert_eq!(names("cat <<EOF\n'$(id)'\nEOF"), vec!["cat", "id"]);
        assert_eq!(names("cat <<EOF\ncosts \\$(5)\nEOF"), vec!["cat"]);
        for quoted in ["'EOF'", "\"EOF\"", "\\EOF", "E'O'F"] {
            let line = format!("cat <<{quoted}\n$(whoami)\nEOF");
            assert_eq!(names(&line), vec!["cat"], "{line}");
        }
    }

    #[test]
    fn test_split_heredoc_body_skipped() {
        let cmds = split_commands("cat <<EOF > notes.txt\nrm -rf /\nEOF\nls").unwrap();
        assert_eq!(
            cmds,
            vec![vec!["cat".to_string()], vec!["ls".to_string()]]
        );
    }

    #[test]
    fn test_split_syntax_errors() {
        assert!(split_commands("echo 'unterminated").is_err());
        assert!(split_commands("echo $(ls").is_err());
        assert!(split_commands("ls )").is_err());
        assert!(split_commands("ls >").is_err());
        assert!(split_commands("cat <<EOF\nno end").is_err());
    }

    #[test]
    fn test_validate_allowed() {
        let v = validator();
        assert!(v.validate("echo hi").is_allowed());
        assert!(v.validate("ls -la src | grep rs | wc -l").is_allowed());
        assert!(v.validate("FOO=1 git status").is_allowed());
        assert!(v.validate("for f in a b; do cat $f; done").is_allowed());
        assert!(v.validate("if test -f x; then cat x; fi").is_allowed());
    }

    #[test]
    fn test_validate_not_in_allowlist() {
        let v = validator();
        match v.validate("curl http://example.com") {
            PolicyDecision::Denied { reason } => assert!(reason.contains("'curl'")),
            other => panic!("expected denial, got {other:?}"),
        }
        // 子命令、引号都不能绕过
        assert!(!v.validate("ls && curl x").is_allowed());
        assert!(!v.validate("echo $(curl x)").is_allowed());
        assert!(!v.validate(r#""curl" x"#).is_allowed());
        assert!(!v.validate("/usr/bin/curl x").is_allowed());
    }

    #[test]
    fn test_validate_denylist_before_allowlist() {
        let policy = CommandPolicy {
            allowed_commands: vec!["rm".into(), "git".into()],
            ..CommandPolicy::default()
        };
        let v = CommandValidator::new(&policy).unwrap();
        assert!(v.validate("rm file.txt").is_allowed());
        match v.validate("rm -rf build") {
            PolicyDecision::Denied { reason } => assert!(reason.contains("recursive forced deletion")),
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(!v.validate("git push origin main").is_allowed());
        assert!(v.validate("git log --oneline").is_allowed());
    }

    #[test]
    fn test_validate_prefix_is_token_based() {
        let policy = CommandPolicy {
            allowed_commands: vec!["cli".into(), "git status".into()],
            denied_commands: vec![],
            denied_arg_patterns: vec![],
            max_command_length: 100,
        };
        let v = CommandValidator::new(&policy).unwrap();
        assert!(v.validate("cli run").is_allowed());
        assert!(!v.validate("cli1 run").is_allowed());
        assert!(v.validate("git status -s").is_allowed());
        assert!(!v.validate("git commit -m x").is_allowed());
    }

    #[test]
    fn test_validate_arg_patterns_and_length() {
        let v = validator();
        assert!(!v.validate("find . -name '*.tmp' -delete").is_allowed());
        assert!(!v.validate("find . -exec cat {} ;").is_allowed());
        assert!(!v.validate("ls | xargs rm").is_allowed());
        assert!(!v.validate("git commit --no-verify -m x").is_allowed());
        let long = format!("echo {}", "a".repeat(5000));
        match v.validate(&long) {
            PolicyDecision::Denied { reason } => assert!(reason.contains("exceeds maximum")),
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(!v.validate("   ").is_allowed());
        assert!(!v.validate("echo 'oops").is_allowed());
    }

    #[test]
    fn test_validate_substitution_inside_arithmetic() {
        let v = validator();
        match v.validate("echo $(( $(whoami | wc -c) ))") {
            PolicyDecision::Denied { reason } => assert!(reason.contains("'whoami'")),
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(!v.validate("echo $(( `id -u` + 0 ))").is_allowed());
        assert!(v.validate("echo $(( $(ls | wc -l) + 1 ))").is_allowed());
    }

    #[test]
    fn test_validate_heredoc_body() {
        let v = validator();
        assert!(!v.validate("cat <<EOF\n$(whoami)\nEOF").is_allowed());
        assert!(!v.validate("cat <<EOF > out.txt\nhello\n$(curl http://example.com)\nEOF").is_allowed());
        assert!(v.validate("cat <<'EOF'\n$(whoami)\nEOF").is_allowed());
        assert!(v.validate("cat <<EOF > notes.txt\nplain text, no substitutions\nEOF").is_allowed());
    }

    #[test]
    fn test_validate_sort_output_option() {
        let v = validator();
        for cmd in [
            "sort -o src/main.rs /dev/null",
            "sort -osrc/main.rs data.txt",
            "sort -no out.txt data.txt",
            "sort --output=src/main.rs data.txt",
            "sort --out src/main.rs data.txt",
            "sort --compress-program=sh data.txt",
        ] {
            assert!(!v.validate(cmd).is_allowed(), "{cmd}");
        }
        assert!(v.validate("sort -k 2 -t , data.csv").is_allowed());
        // -k 的取值不是选项
        assert!(v.validate("sort -k -o data.txt").is_allowed());
        assert!(v.validate("sort -rn data.txt | uniq -c").is_allowed());
    }

    #[test]
    fn test_validate_uniq_output_file() {
        let v = validator();
        match v.validate("uniq input.txt src/lib.rs") {
            PolicyDecision::Denied { reason } => assert!(reason.contains("output file")),
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(v.validate("uniq -c input.txt").is_allowed());
        assert!(v.validate("uniq -f 2 input.txt").is_allowed());
        assert!(v.validate("uniq --skip-chars 3 -d input.txt").is_allowed());
        assert!(!v.validate("uniq -d -- a.txt b.txt").is_allowed());
    }

    #[test]
    fn test_validate_awk_program() {
        let v = validator();
        assert!(v.validate("awk '{print $1}' data.txt").is_allowed());
        assert!(v.validate("awk -F: '$3 > 100 {print $1}' /etc/passwd").is_allowed());
        for cmd in [
            r#"awk 'BEGIN {system("curl x")}'"#,
            r#"awk '{ "date" | getline d; print d }' f"#,
            r#"awk '{print $0 | "sh"}' f"#,
            "awk -f script.awk data.txt",
        ] {
            assert!(!v.validate(cmd).is_allowed(), "{cmd}");
        }
    }

    #[test]
    fn test_invalid_pattern_rejected_at_construction() {
        let policy = CommandPolicy {
            denied_arg_patterns: vec!["(".into()],
            ..CommandPolicy::default()
        };
        assert!(CommandValidator::new(&policy).is_err());
    }
}
