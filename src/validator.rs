//! Quality gate for extraction instructions.
//!
//! A usable instruction tells the extraction model five things: where to
//! look, which alternative labels the value goes by, what shape the answer
//! takes, what to avoid, and what to say when the value is missing. Each
//! element is detected with a pattern heuristic. The gate is soft: one
//! missing element is tolerated, but a short or generic instruction is
//! always rejected.

use crate::config::ValidatorConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

static LOCATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(look(?:ing)? (?:in|at|for|within|near|under)|search(?:ing)? (?:in|the|for|within)|locat(?:ed|e it|ion)|found (?:in|on|at|near|under)|sections?|headings?|headers?|footers?|preamble|recitals?|signature (?:block|page)|first page|cover page|title page|top of|bottom of|tables?|schedules?|exhibits?|appendix|paragraph)\b|\(\d\)|(?m:^\s*\d[.)]\s)",
    )
    .unwrap()
});

static QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"\n]{1,80})"|“([^”\n]{1,80})”"#).unwrap());

static SYNONYM_CUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:also (?:known|referred to|labell?ed) as|synonyms?(?: include| such as| like)?|alternative (?:terms|labels|phrases)(?: include)?|may (?:also )?appear as|variations?(?: include| such as)?|labell?ed as|referred to as)\s*:?\s*([^.\n]+)",
    )
    .unwrap()
});

static LIST_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(?:,|;|\bor\b|\band\b)\s*").unwrap());

static FORMAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(yyyy|mm/dd|dd/mm|iso[ -]?8601|format(?:ted)?|decimals?|digits?|numeric|exact(?:ly)? (?:as|legal)|legal name|verbatim|as (?:it )?(?:is )?written|as it appears|one of the (?:following|listed|allowed)|(?:without|no) currency|percentage|uppercase|lowercase|title case)\b",
    )
    .unwrap()
});

static DISAMBIGUATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(do not|don't|never|exclude|excluding|instead of|rather than|ignore|avoid|not to be confused|distinguish)\b",
    )
    .unwrap()
});

static NOT_FOUND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(not present|not found|cannot be found|can't be found|could not be found|if (?:there is )?no\b|if (?:it is |the value is )?(?:absent|missing|unavailable|not)\b|is (?:missing|absent)|not (?:stated|specified|mentioned|provided|available)|return (?:null|empty|an empty|blank|none)\b|leave (?:it |the field )?blank)",
    )
    .unwrap()
});

static GENERIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:please\s+)?(?:extract|find|get|identify|return)\s+(?:the\s+)?[^.\n]{1,80}?(?:\s+from\s+(?:this|the)\s+(?:document|file|contract|invoice|agreement))?\s*[.?]?\s*$",
    )
    .unwrap()
});

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[[A-Z_ ]{3,}\]|\{\{?\s*\w+\s*\}\}?|(?i:<insert[^>]*>)|\bTODO\b|\bTBD\b").unwrap()
});

const PRECHECK_MIN_ELEMENTS: usize = 3;

const PRECHECK_ORDER: [PromptElement; 5] = [
    PromptElement::Disambiguation,
    PromptElement::NotFound,
    PromptElement::Format,
    PromptElement::Location,
    PromptElement::Synonyms,
];

/// The five things a complete instruction covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PromptElement {
    Location,
    Synonyms,
    Format,
    Disambiguation,
    NotFound,
}

impl PromptElement {
    pub const ALL: [PromptElement; 5] = [
        PromptElement::Location,
        PromptElement::Synonyms,
        PromptElement::Format,
        PromptElement::Disambiguation,
        PromptElement::NotFound,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PromptElement::Location => "LOCATION",
            PromptElement::Synonyms => "SYNONYMS",
            PromptElement::Format => "FORMAT",
            PromptElement::Disambiguation => "DISAMBIGUATION",
            PromptElement::NotFound => "NOT-FOUND",
        }
    }

    /// Concrete fix-it text used when asking the model to repair an instruction.
    pub fn guidance(&self, validation: &PromptValidation, config: &ValidatorConfig) -> String {
        match self {
            PromptElement::Location => format!(
                "{}: name where in the document to look (e.g. \"Look in the first page header, the parties section, or the signature block\"), ideally as numbered locations",
                self.label()
            ),
            PromptElement::Synonyms => format!(
                "{}: need {} distinct quoted phrases, currently have {}. List the alternative labels this value appears under, each in double quotes",
                self.label(),
                config.min_synonyms,
                validation.synonym_count
            ),
            PromptElement::Format => format!(
                "{}: state the exact output format (e.g. YYYY-MM-DD for dates, plain number with two decimals and no currency symbol, exact legal name as written)",
                self.label()
            ),
            PromptElement::Disambiguation => format!(
                "{}: add at least one \"Do not ...\" or \"Exclude ...\" clause naming the values that are commonly confused with this one",
                self.label()
            ),
            PromptElement::NotFound => format!(
                "{}: say exactly what to return when the value is missing (e.g. return \"Not Present\")",
                self.label()
            ),
        }
    }
}

impl fmt::Display for PromptElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Verdict on one candidate instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptValidation {
    pub is_valid: bool,
    pub char_count: usize,
    pub has_location: bool,
    pub has_synonyms: bool,
    pub synonym_count: usize,
    pub has_format: bool,
    pub has_disambiguation: bool,
    pub has_not_found: bool,
    pub is_generic: bool,
    pub missing: Vec<PromptElement>,
    /// Soft defects beyond the five elements.
    pub other_defects: Vec<String>,
    /// Everything wrong, in display order.
    pub defects: Vec<String>,
}

impl PromptValidation {
    pub fn elements_present(&self) -> usize {
        PromptElement::ALL.len() - self.missing.len()
    }

    pub fn is_missing(&self, element: PromptElement) -> bool {
        self.missing.contains(&element)
    }
}

/// Outcome of the cheap check the resolver runs before trusting extracted text.
#[derive(Debug, Clone, PartialEq)]
pub enum PrecheckVerdict {
    Pass,
    TooShort { chars: usize, required: usize },
    Generic,
    SparseElements { found: usize },
}

impl PrecheckVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, PrecheckVerdict::Pass)
    }

    pub fn reason(&self) -> String {
        match self {
            PrecheckVerdict::Pass => "passed".to_string(),
            PrecheckVerdict::TooShort { chars, required } => format!(
                "generated instruction was {} characters, needed {}+",
                chars, required
            ),
            PrecheckVerdict::Generic => {
                "generated instruction was a generic \"extract the X\" sentence".to_string()
            }
            PrecheckVerdict::SparseElements { found } => format!(
                "generated instruction showed only {} of 5 required elements",
                found
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptValidator {
    config: ValidatorConfig,
}

impl PromptValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(&self, text: &str) -> PromptValidation {
        let trimmed = text.trim();
        let char_count = trimmed.chars().count();

        let synonym_count = count_synonyms(trimmed);
        let has_location = self.detect(PromptElement::Location, trimmed);
        let has_synonyms = synonym_count >= self.config.min_synonyms;
        let has_format = self.detect(PromptElement::Format, trimmed);
        let has_disambiguation = self.detect(PromptElement::Disambiguation, trimmed);
        let has_not_found = self.detect(PromptElement::NotFound, trimmed);
        let is_generic = GENERIC_RE.is_match(trimmed);

        let present = [
            (PromptElement::Location, has_location),
            (PromptElement::Synonyms, has_synonyms),
            (PromptElement::Format, has_format),
            (PromptElement::Disambiguation, has_disambiguation),
            (PromptElement::NotFound, has_not_found),
        ];
        let missing: Vec<PromptElement> = present
            .iter()
            .filter(|(_, found)| !found)
            .map(|(element, _)| *element)
            .collect();

        let mut other_defects = Vec::new();
        if char_count > self.config.max_length {
            other_defects.push(format!(
                "too long: {} characters, keep it under {}",
                char_count, self.config.max_length
            ));
        }
        if PLACEHOLDER_RE.is_match(trimmed) {
            other_defects.push("contains unfilled placeholder text".to_string());
        }
        if trimmed.contains("newPrompt") || trimmed.contains("```") {
            other_defects.push("contains response wrapper artifacts (JSON keys or code fences)".to_string());
        }

        let mut defects = Vec::new();
        let too_short = char_count < self.config.min_length;
        if too_short {
            defects.push(format!(
                "too short: {} characters, need at least {}",
                char_count, self.config.min_length
            ));
        }
        if is_generic {
            defects.push("generic instruction: only says to extract the field".to_string());
        }
        for element in &missing {
            let detail = match element {
                PromptElement::Synonyms => format!(
                    "missing SYNONYMS: {} distinct quoted phrases, need {}",
                    synonym_count, self.config.min_synonyms
                ),
                other => format!("missing {}", other.label()),
            };
            defects.push(detail);
        }
        defects.extend(other_defects.iter().cloned());

        let elements_present = PromptElement::ALL.len() - missing.len();
        let is_valid = !too_short
            && !is_generic
            && elements_present >= self.config.min_elements
            && other_defects.len() <= self.config.max_other_defects;

        PromptValidation {
            is_valid,
            char_count,
            has_location,
            has_synonyms,
            synonym_count,
            has_format,
            has_disambiguation,
            has_not_found,
            is_generic,
            missing,
            other_defects,
            defects,
        }
    }

    /// Screen run before trusting extracted text. Uses the same element
    /// detectors as [`validate`](Self::validate) with a lower bar, so anything
    /// `validate` accepts also passes here.
    pub fn precheck(&self, text: &str) -> PrecheckVerdict {
        let trimmed = text.trim();
        let chars = trimmed.chars().count();
        if chars < self.config.min_length {
            return PrecheckVerdict::TooShort {
                chars,
                required: self.config.min_length,
            };
        }
        if GENERIC_RE.is_match(trimmed) {
            return PrecheckVerdict::Generic;
        }

        let required = PRECHECK_MIN_ELEMENTS.min(self.config.min_elements);
        let mut found = 0;
        // Synonym counting is the costliest detector, so it runs last.
        for element in PRECHECK_ORDER {
            if found >= required {
                break;
            }
            if self.detect(element, trimmed) {
                found += 1;
            }
        }
        if found >= required {
            PrecheckVerdict::Pass
        } else {
            PrecheckVerdict::SparseElements { found }
        }
    }

    fn detect(&self, element: PromptElement, text: &str) -> bool {
        match element {
            PromptElement::Location => LOCATION_RE.is_match(text),
            PromptElement::Synonyms => count_synonyms(text) >= self.config.min_synonyms,
            PromptElement::Format => FORMAT_RE.is_match(text),
            PromptElement::Disambiguation => DISAMBIGUATION_RE.is_match(text),
            PromptElement::NotFound => NOT_FOUND_RE.is_match(text),
        }
    }
}

/// Validates with the default thresholds.
pub fn validate(text: &str) -> PromptValidation {
    PromptValidator::default().validate(text)
}

/// Distinct alternative phrases: the larger of the quoted-phrase count and
/// the longest cue-introduced enumeration.
fn count_synonyms(text: &str) -> usize {
    let mut quoted = HashSet::new();
    for caps in QUOTED_RE.captures_iter(text) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            let phrase = m.as_str().trim().to_lowercase();
            if phrase.chars().count() >= 2 {
                quoted.insert(phrase);
            }
        }
    }

    let mut enumerated = HashSet::new();
    for caps in SYNONYM_CUE_RE.captures_iter(text) {
        if let Some(list) = caps.get(1) {
            for item in LIST_SPLIT_RE.split(list.as_str()) {
                let item = item
                    .trim()
                    .trim_matches(|c: char| c == '"' || c == '\'' || c == '“' || c == '”')
                    .trim()
                    .to_lowercase();
                if !item.is_empty() && item.chars().count() <= 60 {
                    enumerated.insert(item);
                }
            }
        }
    }

    quoted.len().max(enumerated.len())
}
