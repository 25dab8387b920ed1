//! Heuristic person-name extraction from free-text contact notes.
//!
//! The heuristic is an ordered list of [`NameRule`]s. Reject rules decide
//! which note line is the candidate; strip rules then clean the candidate
//! before it is tokenized.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

const MAX_NAME_TOKENS: usize = 3;
const MAX_TOKEN_CHARS: usize = 20;
const MIN_NAME_CHARS: usize = 2;
const MAX_NAME_CHARS: usize = 50;

/// Locale-specific word lists feeding the rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameRules {
    /// Substrings that disqualify the first note line (case-insensitive).
    #[serde(default)]
    pub markers: Vec<String>,
    /// Job-title word stems removed from the candidate line.
    #[serde(default)]
    pub titles: Vec<String>,
    /// Organisation-form acronyms removed from the candidate line.
    #[serde(default)]
    pub organizations: Vec<String>,
}

impl Default for NameRules {
    fn default() -> Self {
        let titles = [
            "директор",
            "менеджер",
            "бухгалтер",
            "администратор",
            "руководител",
            "инженер",
            "секретар",
            "специалист",
            "начальник",
            "заместител",
            "снабжен",
            "director",
            "manager",
            "accountant",
        ];
        let mut markers: Vec<String> = titles.iter().map(|s| s.to_string()).collect();
        markers.extend(
            ["отдел", "приемная", "приёмная", "склад", "офис", "магазин", "office", "reception"]
                .iter()
                .map(|s| s.to_string()),
        );
        Self {
            markers,
            titles: titles.iter().map(|s| s.to_string()).collect(),
            organizations: ["ООО", "ОАО", "ЗАО", "ПАО", "АО", "ИП", "LLC", "Ltd", "Inc"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl NameRules {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Disqualify a line from being the name line.
    Reject { first_line_only: bool },
    /// Remove every match from the candidate line.
    Strip,
}

#[derive(Debug, Clone)]
pub struct NameRule {
    pub label: String,
    pub pattern: Regex,
    pub action: RuleAction,
}

impl NameRule {
    fn new(label: &str, pattern: Regex, action: RuleAction) -> Self {
        Self {
            label: label.to_string(),
            pattern,
            action,
        }
    }
}

fn phone_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[\d\s().\-]{7,}$").expect("valid phone line regex"))
}

fn email_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email line regex")
    })
}

fn labelled_phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:тел|т|моб|сот|tel|ph|phone|mob)\b\.?:?\s*\+?\d[\d\s().\-]*")
            .expect("valid labelled phone regex")
    })
}

fn phone_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\d[\d\s().\-]{6,}\d").expect("valid phone run regex"))
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\s@]+@[^\s@]+").expect("valid email regex"))
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""[^"]*"|«[^»]*»|“[^”]*”"#).expect("valid quote regex"))
}

fn alternation(words: &[String]) -> Option<String> {
    let escaped: Vec<String> = words
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .map(regex::escape)
        .collect();
    if escaped.is_empty() {
        None
    } else {
        Some(escaped.join("|"))
    }
}

/// Compiled rule set. Deterministic and total: every input yields a name or `None`.
#[derive(Debug, Clone)]
pub struct NameExtractor {
    rules: Vec<NameRule>,
}

impl Default for NameExtractor {
    // Built-in words are literals escaped by `NameExtractor::new`, so they
    // always compile; file-loaded rules go through `new` and its `Result`.
    fn default() -> Self {
        Self::new(&NameRules::default()).expect("built-in name rules compile")
    }
}

impl NameExtractor {
    pub fn new(words: &NameRules) -> Result<Self> {
        let mut rules = vec![
            NameRule::new(
                "phone-line",
                phone_line_re().clone(),
                RuleAction::Reject {
                    first_line_only: false,
                },
            ),
            NameRule::new(
                "email-line",
                email_line_re().clone(),
                RuleAction::Reject {
                    first_line_only: false,
                },
            ),
        ];
        if let Some(alt) = alternation(&words.markers) {
            let pattern = Regex::new(&format!("(?i)(?:{alt})")).context("compiling marker rule")?;
            rules.push(NameRule::new(
                "marker",
                pattern,
                RuleAction::Reject {
                    first_line_only: true,
                },
            ));
        }

        rules.push(NameRule::new("labelled-phone", labelled_phone_re().clone(), RuleAction::Strip));
        rules.push(NameRule::new("phone-run", phone_run_re().clone(), RuleAction::Strip));
        rules.push(NameRule::new("email", email_re().clone(), RuleAction::Strip));
        if let Some(alt) = alternation(&words.titles) {
            let pattern =
                Regex::new(&format!(r"(?i)\b(?:{alt})\w*\.?")).context("compiling title rule")?;
            rules.push(NameRule::new("job-title", pattern, RuleAction::Strip));
        }
        rules.push(NameRule::new("quoted", quoted_re().clone(), RuleAction::Strip));
        if let Some(alt) = alternation(&words.organizations) {
            let pattern = Regex::new(&format!(r"(?i)\b(?:{alt})\b\.?"))
                .context("compiling organization rule")?;
            rules.push(NameRule::new("organization", pattern, RuleAction::Strip));
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[NameRule] {
        &self.rules
    }

    fn rejected(&self, line: &str, first_line: bool) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| match rule.action {
                RuleAction::Reject { first_line_only } => {
                    (first_line || !first_line_only) && rule.pattern.is_match(line)
                }
                RuleAction::Strip => false,
            })
            .map(|rule| rule.label.as_str())
    }

    fn strip(&self, line: &str) -> String {
        let mut text = line.to_string();
        for rule in self.rules.iter().filter(|r| r.action == RuleAction::Strip) {
            text = rule.pattern.replace_all(&text, " ").into_owned();
        }
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '-' | '–' | '—') || c.is_whitespace())
            .to_string()
    }

    /// Picks the note line most likely to hold a person's name.
    fn candidate_line<'n>(&self, lines: &[&'n str]) -> Option<&'n str> {
        let first = *lines.first()?;
        if self.rejected(first, true).is_none() {
            return Some(first);
        }
        let second = *lines.get(1)?;
        if self.rejected(second, false).is_none() {
            Some(second)
        } else {
            None
        }
    }

    pub fn extract(&self, notes: &str) -> Option<String> {
        let lines: Vec<&str> = notes
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let candidate = self.strip(self.candidate_line(&lines)?);

        let mut tokens = Vec::with_capacity(MAX_NAME_TOKENS);
        for raw in candidate.split_whitespace() {
            let token = raw.trim_matches(|c: char| matches!(c, ',' | ';' | ':'));
            if token.is_empty() {
                continue;
            }
            let numeric = token.chars().any(|c| c.is_ascii_digit());
            if numeric || token.contains('@') || token.chars().count() > MAX_TOKEN_CHARS {
                break;
            }
            tokens.push(token);
            if tokens.len() == MAX_NAME_TOKENS {
                break;
            }
        }

        let name = tokens.join(" ");
        let len = name.chars().count();
        if (MIN_NAME_CHARS..=MAX_NAME_CHARS).contains(&len) && name.chars().any(char::is_alphabetic) {
            Some(name)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> NameExtractor {
        NameExtractor::default()
    }

    #[test]
    fn name_on_first_line_with_phone_below() {
        assert_eq!(
            extractor().extract("Иванов Петр\nт. +7 900 123 45 67").as_deref(),
            Some("Иванов Петр")
        );
    }

    #[test]
    fn bare_phone_yields_nothing() {
        assert_eq!(extractor().extract("8 900 123 45 67"), None);
    }

    #[test]
    fn job_title_line_falls_through_to_second_line() {
        assert_eq!(
            extractor().extract("директор\nСидоров А.А.").as_deref(),
            Some("Сидоров А.А.")
        );
    }

    #[test]
    fn second_line_is_still_checked_for_phone_and_email() {
        assert_eq!(extractor().extract("Главный бухгалтер\n+7 (495) 123-45-67"), None);
        assert_eq!(extractor().extract("отдел продаж\nsales@example.com"), None);
        assert_eq!(extractor().extract("отдел продаж"), None);
    }

    #[test]
    fn empty_and_blank_notes_yield_nothing() {
        assert_eq!(extractor().extract(""), None);
        assert_eq!(extractor().extract("   \n\n  "), None);
    }

    #[test]
    fn inline_noise_is_stripped() {
        let ex = extractor();
        assert_eq!(
            ex.extract("Петрова Анна тел. 8-916-555-44-33 anna@mail.ru").as_deref(),
            Some("Петрова Анна")
        );
        assert_eq!(
            ex.extract("ООО \"Ромашка\" Кузнецов Олег").as_deref(),
            Some("Кузнецов Олег")
        );
    }

    #[test]
    fn at_most_three_tokens_and_stop_at_numbers() {
        let ex = extractor();
        assert_eq!(
            ex.extract("Смирнов Иван Сергеевич младший").as_deref(),
            Some("Смирнов Иван Сергеевич")
        );
        assert_eq!(ex.extract("Орлов кв 15").as_deref(), Some("Орлов кв"));
        assert_eq!(ex.extract("12345"), None);
    }

    #[test]
    fn overlong_token_stops_accumulation() {
        let ex = extractor();
        assert_eq!(
            ex.extract("Ли Аааааааааааааааааааааааа").as_deref(),
            Some("Ли")
        );
        assert_eq!(ex.extract("Я"), None);
    }

    #[test]
    fn extraction_is_deterministic() {
        let ex = extractor();
        let notes = "Иванов Петр\nт. +7 900 123 45 67";
        assert_eq!(ex.extract(notes), ex.extract(notes));
    }

    #[test]
    fn each_rule_is_individually_testable() {
        let ex = extractor();
        let rule = |label: &str| {
            ex.rules()
                .iter()
                .find(|r| r.label == label)
                .unwrap_or_else(|| panic!("rule {label}"))
        };
        assert!(rule("phone-line").pattern.is_match("8 900 123 45 67"));
        assert!(!rule("phone-line").pattern.is_match("Иванов 8 900"));
        assert!(rule("email-line").pattern.is_match("a.b@example.com"));
        assert!(rule("marker").pattern.is_match("ГЛАВНЫЙ БУХГАЛТЕР"));
        assert!(rule("job-title").pattern.is_match("менеджером"));
        assert!(rule("organization").pattern.is_match("ИП Петров"));
        assert!(rule("quoted").pattern.is_match("«Вектор»"));
    }

    #[test]
    fn custom_rules_replace_defaults() {
        let ex = NameExtractor::new(&NameRules {
            markers: vec!["sales".into()],
            titles: vec![],
            organizations: vec![],
        })
        .unwrap();
        assert_eq!(ex.extract("Sales team\nJohn Smith").as_deref(), Some("John Smith"));
        assert_eq!(ex.extract("директор").as_deref(), Some("директор"));
    }

    #[test]
    fn rules_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("name_rules.yaml");
        std::fs::write(&path, "markers: [склад]\ntitles: [кладовщик]\n").unwrap();
        let rules = NameRules::from_yaml_file(&path).unwrap();
        assert_eq!(rules.markers, vec!["склад".to_string()]);
        assert!(rules.organizations.is_empty());
    }
}
