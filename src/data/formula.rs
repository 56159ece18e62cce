//! Formula parsing for model specification.
//!
//! Supports lme4-style mixed model formulas with a single random intercept:
//! - `y ~ treat + (1 | subject)`
//! - `y ~ dose * sex + (1 | litter)`
//! - `y ~ 0 + treat + (1 | subject)`

use crate::error::{LmmError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A term in a fixed-effects formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    /// Intercept term (constant).
    Intercept,
    /// Main effect of a variable.
    Main(String),
    /// Interaction between two variables.
    Interaction(String, String),
}

impl Term {
    /// Get the variable names involved in this term.
    pub fn variables(&self) -> Vec<&str> {
        match self {
            Term::Intercept => vec![],
            Term::Main(v) => vec![v.as_str()],
            Term::Interaction(v1, v2) => vec![v1.as_str(), v2.as_str()],
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Intercept => write!(f, "1"),
            Term::Main(v) => write!(f, "{}", v),
            Term::Interaction(v1, v2) => write!(f, "{}:{}", v1, v2),
        }
    }
}

/// The fixed-effects part of a formula (right-hand side only).
///
/// - `~ group` - intercept + group
/// - `~ group * age` - intercept + group + age + group:age
/// - `~ 0 + group` - no intercept, group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    /// Whether to include an intercept.
    pub intercept: bool,
    /// Terms in the formula (excluding intercept).
    pub terms: Vec<Term>,
}

impl Formula {
    /// Parse a right-hand side such as `~ group + age`.
    ///
    /// # Examples
    /// ```
    /// use lmm_mle::data::Formula;
    /// let f = Formula::parse("~ group + age").unwrap();
    /// assert!(f.intercept);
    /// assert_eq!(f.terms.len(), 2);
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let formula = formula.trim();

        if !formula.starts_with('~') {
            return Err(LmmError::FormulaParse(
                "Formula must start with '~'".to_string(),
            ));
        }

        let rhs = formula[1..].trim();
        if rhs.is_empty() {
            return Err(LmmError::FormulaParse(
                "Formula right-hand side is empty".to_string(),
            ));
        }

        let (intercept, rhs) = if rhs == "0" || rhs == "-1" {
            return Err(LmmError::FormulaParse(
                "Formula must have at least one term".to_string(),
            ));
        } else if rhs.starts_with("0 +") || rhs.starts_with("0+") {
            (false, rhs.trim_start_matches('0').trim_start().trim_start_matches('+').trim())
        } else if rhs.starts_with("-1 +") || rhs.starts_with("-1+") {
            (false, rhs.trim_start_matches("-1").trim_start().trim_start_matches('+').trim())
        } else {
            (true, rhs)
        };

        let mut terms = Vec::new();
        for term_str in rhs.split('+').map(|s| s.trim()) {
            if term_str.is_empty() || term_str == "1" {
                continue;
            }

            if term_str.contains('*') {
                let (v1, v2) = split_pair(term_str, '*')?;
                let main1 = Term::Main(v1.clone());
                let main2 = Term::Main(v2.clone());
                if !terms.contains(&main1) {
                    terms.push(main1);
                }
                if !terms.contains(&main2) {
                    terms.push(main2);
                }
                terms.push(Term::Interaction(v1, v2));
            } else if term_str.contains(':') {
                let (v1, v2) = split_pair(term_str, ':')?;
                terms.push(Term::Interaction(v1, v2));
            } else if is_identifier(term_str) {
                let main = Term::Main(term_str.to_string());
                if !terms.contains(&main) {
                    terms.push(main);
                }
            } else {
                return Err(LmmError::FormulaParse(format!(
                    "Invalid term: '{}'",
                    term_str
                )));
            }
        }

        if terms.is_empty() && !intercept {
            return Err(LmmError::FormulaParse(
                "Formula must have at least one term".to_string(),
            ));
        }

        Ok(Self { intercept, terms })
    }

    /// Intercept-only formula.
    pub fn intercept_only() -> Self {
        Self {
            intercept: true,
            terms: Vec::new(),
        }
    }

    /// Get all variable names used in the formula.
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = self.terms.iter().flat_map(|t| t.variables()).collect();
        vars.sort();
        vars.dedup();
        vars
    }

    /// Check if a variable is used in the formula.
    pub fn uses_variable(&self, name: &str) -> bool {
        self.terms.iter().any(|t| t.variables().contains(&name))
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "~ ")?;
        if !self.intercept {
            write!(f, "0 + ")?;
        }
        if self.terms.is_empty() {
            return write!(f, "1");
        }
        let term_strs: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        write!(f, "{}", term_strs.join(" + "))
    }
}

fn split_pair(term: &str, sep: char) -> Result<(String, String)> {
    let parts: Vec<&str> = term.split(sep).map(|s| s.trim()).collect();
    if parts.len() != 2 || !parts.iter().all(|p| is_identifier(p)) {
        return Err(LmmError::FormulaParse(format!(
            "Invalid interaction term: {}",
            term
        )));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

/// A mixed model formula: response, fixed effects and one random-intercept factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedFormula {
    /// Response variable (left-hand side).
    pub response: String,
    /// Fixed effects.
    pub fixed: Formula,
    /// Grouping variable of the random intercept.
    pub grouping: String,
    /// Original formula string.
    pub formula_str: String,
}

impl MixedFormula {
    /// Parse `response ~ fixed terms + (1 | group)`.
    ///
    /// Exactly one random-intercept term is accepted; random slopes and
    /// additional grouping factors are rejected.
    ///
    /// # Examples
    /// ```
    /// use lmm_mle::data::MixedFormula;
    /// let f = MixedFormula::parse("y ~ treat + (1 | ind)").unwrap();
    /// assert_eq!(f.response, "y");
    /// assert_eq!(f.grouping, "ind");
    /// assert!(f.fixed.intercept);
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let formula_str = formula.trim().to_string();

        let (lhs, rhs) = formula_str.split_once('~').ok_or_else(|| {
            LmmError::FormulaParse("Formula must contain '~'".to_string())
        })?;
        let response = lhs.trim();
        if response.is_empty() {
            return Err(LmmError::FormulaParse(
                "Formula needs a response on the left of '~'".to_string(),
            ));
        }
        if !is_identifier(response) {
            return Err(LmmError::FormulaParse(format!(
                "Invalid response name: '{}'",
                response
            )));
        }

        let re = Regex::new(r"\(([^()|]*)\|([^()|]*)\)")
            .map_err(|e| LmmError::FormulaParse(e.to_string()))?;
        let random: Vec<(String, String, String)> = re
            .captures_iter(rhs)
            .map(|c| (c[0].to_string(), c[1].trim().to_string(), c[2].trim().to_string()))
            .collect();

        let (random_str, terms, grouping) = match random.as_slice() {
            [] => {
                return Err(LmmError::FormulaParse(
                    "Formula must contain a random intercept term such as (1 | group)"
                        .to_string(),
                ))
            }
            [single] => single.clone(),
            _ => {
                return Err(LmmError::FormulaParse(
                    "Only one random-intercept grouping factor is supported".to_string(),
                ))
            }
        };

        if terms != "1" {
            return Err(LmmError::FormulaParse(format!(
                "Only random intercepts (1 | group) are supported, got '{}'",
                random_str
            )));
        }
        if grouping.is_empty() || !is_identifier(&grouping) {
            return Err(LmmError::FormulaParse(format!(
                "Invalid grouping variable in '{}'",
                random_str
            )));
        }

        let fixed_str = rhs
            .replace(&random_str, "")
            .split('+')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" + ");
        if fixed_str.contains('(') || fixed_str.contains('|') {
            return Err(LmmError::FormulaParse(format!(
                "Malformed random effect in '{}'",
                formula_str
            )));
        }

        let fixed = if fixed_str.is_empty() {
            Formula::intercept_only()
        } else {
            Formula::parse(&format!("~ {}", fixed_str))?
        };

        if fixed.uses_variable(response) || fixed.uses_variable(&grouping) {
            return Err(LmmError::FormulaParse(
                "Response and grouping variable cannot appear as fixed effects".to_string(),
            ));
        }

        Ok(Self {
            response: response.to_string(),
            fixed,
            grouping,
            formula_str,
        })
    }

    /// All variables referenced by the formula.
    pub fn all_variables(&self) -> Vec<&str> {
        let mut vars = self.fixed.variables();
        vars.push(&self.response);
        vars.push(&self.grouping);
        vars.sort();
        vars.dedup();
        vars
    }
}

impl std::fmt::Display for MixedFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.formula_str)
    }
}
