//! Deterministic intent rules: exact phrases, keywords, regex patterns.
//!
//! Builtin rules cover short conversational acknowledgements in Chinese and
//! English. Custom rules are loaded from YAML and merged after the builtins:
//!
//! ```yaml
//! rules:
//!   - intent: CONTINUE_EXECUTION
//!     exact: ["搞起"]
//!     keywords: ["接着来"]
//!     patterns: ["^go+!*$"]
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::types::IntentKind;

const CONTINUE_EXACT: &[&str] = &[
    "继续", "好的", "好", "好啊", "可以", "行", "嗯", "嗯嗯", "是的", "对", "没问题", "开始吧",
    "继续吧", "继续执行", "执行吧", "ok", "okay", "k", "yes", "y", "sure", "continue", "go",
    "go on", "go ahead", "proceed", "next", "👍",
];

const CANCEL_EXACT: &[&str] = &[
    "算了", "不做了", "取消", "停", "停止", "不要了", "别做了", "放弃", "不用了", "cancel",
    "stop", "abort", "quit", "never mind", "nevermind", "forget it",
];

// Order matters: modification wins over cancel and continue when several hit.
const MODIFY_KEYWORDS: &[&str] = &[
    "修改", "改", "调整", "换成", "变更", "替换", "重新", "modify", "change", "adjust", "instead",
];

const CANCEL_KEYWORDS: &[&str] = &[
    "算了", "不做了", "取消", "停止", "放弃", "别做", "不要做", "不要继续", "别继续", "cancel",
    "abort", "stop",
];

const CONTINUE_KEYWORDS: &[&str] = &[
    "继续", "接着", "下一步", "往下", "continue", "proceed", "go ahead", "keep going", "carry on",
];

const MODIFY_PATTERNS: &[&str] = &[
    r"^(不对|不是)[，,\s]",
    r"应该(是|用|为)",
    r"把.+(变成|设为|设置为|调成)",
    r"(?i)\b(should be|make it|set it to|use .+ rather)\b",
];

const CANCEL_PATTERNS: &[&str] = &[
    r"(?i)^(no|nope|nah)[.!]*$",
    r"^(不|别)(要|用)?(再)?(做|弄|搞)了",
    r"(?i)\bdon'?t\b.*\b(anymore|bother)\b",
];

const CONTINUE_PATTERNS: &[&str] = &[
    r"(?i)^(y(es|ep|eah|up)?|ok(ay)?|sure)[!.]*$",
    r"^(对|是)的?[，,]?(就)?(这样|这么办)",
    r"^(然后呢|接下来呢|下面呢)",
];

#[cfg(test)]
pub(crate) const MODIFY_PATTERN_COUNT: usize = MODIFY_PATTERNS.len();
#[cfg(test)]
pub(crate) const CANCEL_PATTERN_COUNT: usize = CANCEL_PATTERNS.len();
#[cfg(test)]
pub(crate) const CONTINUE_PATTERN_COUNT: usize = CONTINUE_PATTERNS.len();

/// One rule block in a custom rule file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub intent: String,
    #[serde(default)]
    pub exact: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

/// Compiled rule tables, checked in order: exact, keywords, patterns.
#[derive(Debug, Clone)]
pub struct IntentRules {
    pub(crate) exact: HashMap<String, IntentKind>,
    pub(crate) keywords: Vec<(String, IntentKind)>,
    pub(crate) patterns: Vec<(Regex, IntentKind)>,
}

impl Default for IntentRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl IntentRules {
    pub fn empty() -> Self {
        Self {
            exact: HashMap::new(),
            keywords: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut rules = Self::empty();
        for phrase in CONTINUE_EXACT {
            rules.add_exact(phrase, IntentKind::ContinueExecution);
        }
        for phrase in CANCEL_EXACT {
            rules.add_exact(phrase, IntentKind::CancelTask);
        }
        for (words, kind) in [
            (MODIFY_KEYWORDS, IntentKind::ModifyRequirement),
            (CANCEL_KEYWORDS, IntentKind::CancelTask),
            (CONTINUE_KEYWORDS, IntentKind::ContinueExecution),
        ] {
            for w in words {
                rules.keywords.push((w.to_lowercase(), kind));
            }
        }
        for (patterns, kind) in [
            (MODIFY_PATTERNS, IntentKind::ModifyRequirement),
            (CANCEL_PATTERNS, IntentKind::CancelTask),
            (CONTINUE_PATTERNS, IntentKind::ContinueExecution),
        ] {
            for p in patterns {
                // Builtin patterns are static and covered by tests.
                if let Ok(re) = Regex::new(p) {
                    rules.patterns.push((re, kind));
                }
            }
        }
        rules
    }

    fn add_exact(&mut self, phrase: &str, kind: IntentKind) {
        let key = normalize(phrase);
        if !key.is_empty() {
            self.exact.entry(key).or_insert(kind);
        }
    }

    /// Merge custom rules after the existing ones. Existing exact phrases
    /// keep their intent; keywords and patterns are appended.
    pub fn merge(&mut self, specs: Vec<RuleSpec>) -> Result<()> {
        for spec in specs {
            let kind = IntentKind::parse(&spec.intent)
                .with_context(|| format!("unknown intent '{}' in rule file", spec.intent))?;
            for phrase in &spec.exact {
                self.add_exact(phrase, kind);
            }
            for kw in spec.keywords {
                let kw = kw.trim().to_lowercase();
                if !kw.is_empty() {
                    self.keywords.push((kw, kind));
                }
            }
            for p in spec.patterns {
                let re = Regex::new(&p).with_context(|| format!("invalid intent pattern '{}'", p))?;
                self.patterns.push((re, kind));
            }
        }
        Ok(())
    }

    pub fn merge_yaml_str(&mut self, content: &str) -> Result<()> {
        let file: RuleFile = serde_yaml::from_str(content).context("invalid intent rule YAML")?;
        self.merge(file.rules)
    }

    /// Builtins plus the rules in `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read intent rules: {}", path.display()))?;
        let mut rules = Self::builtin();
        rules.merge_yaml_str(&content)?;
        tracing::debug!("Merged intent rules from {}", path.display());
        Ok(rules)
    }

    pub fn exact_match(&self, normalized: &str) -> Option<IntentKind> {
        self.exact.get(normalized).copied()
    }

    /// First keyword hit in table order, with the matched keyword.
    pub fn keyword_match(&self, normalized: &str) -> Option<(&str, IntentKind)> {
        self.keywords
            .iter()
            .find(|(kw, _)| contains_keyword(normalized, kw))
            .map(|(kw, kind)| (kw.as_str(), *kind))
    }

    pub fn pattern_match(&self, normalized: &str) -> Option<(&Regex, IntentKind)> {
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(normalized))
            .map(|(re, kind)| (re, *kind))
    }
}

/// Trim, lowercase, collapse whitespace and drop trailing punctuation.
pub fn normalize(utterance: &str) -> String {
    let lower = utterance.trim().to_lowercase();
    let collapsed = lower.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| {
            c.is_ascii_punctuation() || "。！？，、；：～…".contains(c)
        })
        .trim()
        .to_string()
}

/// Substring match for CJK keywords; word-boundary match for ASCII ones so
/// that "change" does not fire inside "exchange".
pub(crate) fn contains_keyword(text: &str, keyword: &str) -> bool {
    if keyword.is_empty() {
        return false;
    }
    if !keyword.is_ascii() {
        return text.contains(keyword);
    }
    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut from = 0;
    while let Some(pos) = text[from..].find(keyword) {
        let start = from + pos;
        let end = start + keyword.len();
        let before_ok = text[..start].chars().next_back().map_or(true, |c| !is_word(c));
        let after_ok = text[end..].chars().next().map_or(true, |c| !is_word(c));
        if before_ok && after_ok {
            return true;
        }
        from = start + keyword.len();
    }
    false
}
