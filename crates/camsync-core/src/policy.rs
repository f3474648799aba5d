//! ID-number policy engine
//!
//! A policy is a boolean formula over the presence of patient identifiers:
//! `sex AND ((forename AND surname AND dob) OR anyidnum)`. The server defines
//! one policy for uploading and a stricter one for finalizing; both are
//! evaluated here, locally, before any data leaves the device.
//!
//! Evaluation is pure and total. An unparsable policy never evaluates to
//! "compliant"; a valid but empty policy matches anything.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use thiserror::Error;

use crate::models::Patient;

/// Default policy compiled into the client: enough identification for a
/// clinical environment, or one ID number for pseudonymised research use.
pub const DEFAULT_DEVICE_POLICY: &str = "sex AND ((forename AND surname AND dob) OR anyidnum)";

const TOKENIZE_PATTERN: &str = r"\s*(\w+|\(|\))";

/// One lexical element of a policy expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    AnyIdNum,
    OtherIdNum,
    Forename,
    Surname,
    Sex,
    Dob,
    Email,
    Address,
    Gp,
    OtherDetails,
    /// `idnumN` for ID number type N (N >= 1)
    IdNum(u16),
}

impl Token {
    fn from_word(word: &str) -> Option<Self> {
        match word {
            "(" => Some(Self::LParen),
            ")" => Some(Self::RParen),
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            "not" => Some(Self::Not),
            "anyidnum" => Some(Self::AnyIdNum),
            "otheridnum" => Some(Self::OtherIdNum),
            "forename" => Some(Self::Forename),
            "surname" => Some(Self::Surname),
            "sex" => Some(Self::Sex),
            "dob" => Some(Self::Dob),
            "email" => Some(Self::Email),
            "address" => Some(Self::Address),
            "gp" => Some(Self::Gp),
            "otherdetails" => Some(Self::OtherDetails),
            _ => {
                let number = word.strip_prefix("idnum")?;
                match number.parse::<u16>() {
                    Ok(which) if which >= 1 => Some(Self::IdNum(which)),
                    _ => None,
                }
            }
        }
    }

    fn name(self) -> String {
        match self {
            Self::LParen => "(".to_string(),
            Self::RParen => ")".to_string(),
            Self::And => "and".to_string(),
            Self::Or => "or".to_string(),
            Self::Not => "not".to_string(),
            Self::AnyIdNum => "anyidnum".to_string(),
            Self::OtherIdNum => "otheridnum".to_string(),
            Self::Forename => "forename".to_string(),
            Self::Surname => "surname".to_string(),
            Self::Sex => "sex".to_string(),
            Self::Dob => "dob".to_string(),
            Self::Email => "email".to_string(),
            Self::Address => "address".to_string(),
            Self::Gp => "gp".to_string(),
            Self::OtherDetails => "otherdetails".to_string(),
            Self::IdNum(which) => format!("idnum{which}"),
        }
    }
}

/// A policy expression failed to parse
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Syntax error in policy ({message}); policy text is: {text:?}")]
pub struct PolicyParseError {
    pub message: String,
    pub text: String,
}

/// The identifying information a patient actually carries, as the policy
/// engine sees it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientFacts {
    pub has_forename: bool,
    pub has_surname: bool,
    pub has_sex: bool,
    pub has_dob: bool,
    pub has_email: bool,
    pub has_address: bool,
    pub has_gp: bool,
    pub has_other_details: bool,
    /// ID number types with an assigned value
    pub id_num_types: BTreeSet<u16>,
}

impl From<&Patient> for PatientFacts {
    fn from(patient: &Patient) -> Self {
        let present = |field: &Option<String>| {
            field
                .as_deref()
                .is_some_and(|value| !value.trim().is_empty())
        };
        Self {
            has_forename: present(&patient.forename),
            has_surname: present(&patient.surname),
            has_sex: present(&patient.sex),
            has_dob: present(&patient.dob),
            has_email: present(&patient.email),
            has_address: present(&patient.address),
            has_gp: present(&patient.gp),
            has_other_details: present(&patient.other_details),
            id_num_types: patient.id_numbers.keys().copied().collect(),
        }
    }
}

/// Outcome of evaluating a policy expression against a patient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compliance {
    Compliant,
    NonCompliant,
    /// The policy string did not parse; this is never treated as compliant
    InvalidPolicy,
}

/// Evaluate a raw policy string against a patient's identifiers.
///
/// Total: never panics, and an unparsable policy yields
/// [`Compliance::InvalidPolicy`], not a compliance verdict.
#[must_use]
pub fn evaluate(policy_text: &str, facts: &PatientFacts) -> Compliance {
    match IdPolicy::parse(policy_text) {
        Ok(policy) => {
            if policy.complies(facts) {
                Compliance::Compliant
            } else {
                Compliance::NonCompliant
            }
        }
        Err(_) => Compliance::InvalidPolicy,
    }
}

/// A parsed, valid ID policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPolicy {
    text: String,
    tokens: Vec<Token>,
    mentioned: BTreeSet<u16>,
}

impl IdPolicy {
    /// Parse a policy expression, validating its syntax up front
    pub fn parse(text: &str) -> Result<Self, PolicyParseError> {
        let tokens = tokenize(text)?;
        let mentioned = tokens
            .iter()
            .filter_map(|token| match token {
                Token::IdNum(which) => Some(*which),
                _ => None,
            })
            .collect();
        let policy = Self {
            text: text.to_string(),
            tokens,
            mentioned,
        };
        // Syntax check against a blank patient; the verdict is discarded.
        if !policy.tokens.is_empty() {
            policy
                .eval_chunk(&policy.tokens, &PatientFacts::default())
                .map_err(|message| PolicyParseError {
                    message,
                    text: text.to_string(),
                })?;
        }
        Ok(policy)
    }

    /// Does a patient with these facts satisfy the policy?
    ///
    /// A valid empty policy matches anything.
    #[must_use]
    pub fn complies(&self, facts: &PatientFacts) -> bool {
        if self.tokens.is_empty() {
            return true;
        }
        // Syntax was validated at parse time.
        self.eval_chunk(&self.tokens, facts).unwrap_or(false)
    }

    /// The policy text as supplied
    #[must_use]
    pub fn original(&self) -> &str {
        &self.text
    }

    /// ID number types the policy names explicitly
    #[must_use]
    pub const fn mentioned_id_nums(&self) -> &BTreeSet<u16> {
        &self.mentioned
    }

    /// Canonical rendering: operators uppercased, single spacing
    #[must_use]
    pub fn pretty(&self) -> String {
        let mut rendered = String::new();
        for (index, token) in self.tokens.iter().enumerate() {
            if index > 0
                && *token != Token::RParen
                && self.tokens[index - 1] != Token::LParen
            {
                rendered.push(' ');
            }
            let name = token.name();
            if matches!(token, Token::And | Token::Or) {
                rendered.push_str(&name.to_uppercase());
            } else {
                rendered.push_str(&name);
            }
        }
        rendered
    }

    /// Evaluate a run of `content (op content)*` tokens
    fn eval_chunk(&self, tokens: &[Token], facts: &PatientFacts) -> Result<bool, String> {
        let mut want_content = true;
        let mut conjunction = false;
        let mut disjunction = false;
        let mut value: Option<bool> = None;
        let mut index = 0;
        while index < tokens.len() {
            if want_content {
                let next = self.eval_content(tokens, facts, &mut index)?;
                value = Some(match value {
                    None => next,
                    Some(current) if conjunction => current && next,
                    Some(current) if disjunction => current || next,
                    Some(_) => return Err("invalid expression".to_string()),
                });
                conjunction = false;
                disjunction = false;
            } else {
                match tokens.get(index) {
                    Some(Token::And) => conjunction = true,
                    Some(Token::Or) => disjunction = true,
                    _ => return Err("missing operator".to_string()),
                }
                index += 1;
            }
            want_content = !want_content;
        }
        match value {
            Some(result) if !want_content => Ok(result),
            _ => Err("policy incomplete".to_string()),
        }
    }

    /// Evaluate one content element: a field, a NOT, or a parenthesized chunk
    fn eval_content(
        &self,
        tokens: &[Token],
        facts: &PatientFacts,
        index: &mut usize,
    ) -> Result<bool, String> {
        let Some(token) = tokens.get(*index).copied() else {
            return Err("policy incomplete; missing content at end".to_string());
        };
        *index += 1;
        match token {
            Token::RParen | Token::And | Token::Or => {
                Err("chunk can't start with AND/OR/')'".to_string())
            }
            Token::LParen => {
                let chunk_start = *index;
                let mut depth = 1usize;
                while depth > 0 {
                    let Some(subtoken) = tokens.get(*index).copied() else {
                        return Err("unmatched left parenthesis".to_string());
                    };
                    *index += 1;
                    match subtoken {
                        Token::LParen => depth += 1,
                        Token::RParen => depth -= 1,
                        _ => {}
                    }
                }
                // Everything between the parentheses, exclusive.
                self.eval_chunk(&tokens[chunk_start..*index - 1], facts)
            }
            Token::Not => Ok(!self.eval_content(tokens, facts, index)?),
            element => Ok(self.eval_element(element, facts)),
        }
    }

    fn eval_element(&self, token: Token, facts: &PatientFacts) -> bool {
        match token {
            Token::Forename => facts.has_forename,
            Token::Surname => facts.has_surname,
            Token::Sex => facts.has_sex,
            Token::Dob => facts.has_dob,
            Token::Email => facts.has_email,
            Token::Address => facts.has_address,
            Token::Gp => facts.has_gp,
            Token::OtherDetails => facts.has_other_details,
            Token::AnyIdNum => !facts.id_num_types.is_empty(),
            Token::OtherIdNum => facts
                .id_num_types
                .iter()
                .any(|which| !self.mentioned.contains(which)),
            Token::IdNum(which) => facts.id_num_types.contains(&which),
            // Structural tokens never reach element evaluation.
            Token::LParen | Token::RParen | Token::And | Token::Or | Token::Not => false,
        }
    }
}

impl fmt::Display for IdPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pretty())
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, PolicyParseError> {
    let re = Regex::new(TOKENIZE_PATTERN).map_err(|error| PolicyParseError {
        message: format!("internal tokenizer error: {error}"),
        text: text.to_string(),
    })?;
    let mut tokens = Vec::new();
    for capture in re.captures_iter(text) {
        let word = capture[1].to_lowercase();
        let token = Token::from_word(&word).ok_or_else(|| PolicyParseError {
            message: format!("unknown word: {word}"),
            text: text.to_string(),
        })?;
        tokens.push(token);
    }
    Ok(tokens)
}
