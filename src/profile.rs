//! User profile discovery and the profile gate
//!
//! The profile is learned from user messages and only ever enriched.
//! The gate decides whether there is enough context to give advice.

use crate::models::{RiskTolerance, UserProfile};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

lazy_static! {
    static ref AGE_PATTERNS: Vec<Regex> = compile(&[
        r"\bi(?:'m| am) (\d{2,3})\b(?: years old)?",
        r"\b(\d{2,3}) years? old\b",
        r"\bage[:\s]+(\d{2,3})\b",
    ]);
    static ref HORIZON_PATTERNS: Vec<Regex> = compile(&[
        r"(\d+)\s*-?\s*years?\s*(?:time\s*)?horizon",
        r"horizon\s*(?:of\s*)?(\d+)\s*years?",
        r"invest(?:ing)?\s*for\s*(\d+)\s*years?",
        r"retire\s*in\s*(\d+)\s*years?",
    ]);
    static ref GOAL_STATEMENT: Regex =
        Regex::new(r"\b(?:my goal is to|i want to|i'm saving for|i am saving for|saving for)\s+([^.!?\n]{3,60})")
            .unwrap_or_else(|e| panic!("invalid goal pattern: {}", e));
}

/// Keyword → canonical goal name.
const GOAL_KEYWORDS: &[(&str, &str)] = &[
    ("retire", "retirement"),
    ("buy a home", "buy a home"),
    ("buy a house", "buy a home"),
    ("down payment", "buy a home"),
    ("college", "education"),
    ("tuition", "education"),
    ("education", "education"),
    ("emergency fund", "emergency fund"),
    ("pay off debt", "pay off debt"),
    ("passive income", "passive income"),
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("invalid profile pattern {}: {}", p, e)))
        .collect()
}

/// Fields discovered in one message. `None` / empty means "nothing learned".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub age: Option<u32>,
    pub risk_tolerance: Option<RiskTolerance>,
    pub time_horizon_years: Option<u32>,
    pub financial_goals: Vec<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.age.is_none()
            && self.risk_tolerance.is_none()
            && self.time_horizon_years.is_none()
            && self.financial_goals.is_empty()
    }
}

impl UserProfile {
    /// Field-by-field merge. Known facts are never cleared.
    pub fn merge(&mut self, update: ProfileUpdate) {
        if let Some(age) = update.age {
            self.age = Some(age);
        }
        if let Some(risk) = update.risk_tolerance {
            self.risk_tolerance = Some(risk);
        }
        if let Some(years) = update.time_horizon_years {
            self.time_horizon_years = Some(years);
        }
        for goal in update.financial_goals {
            if !self.financial_goals.iter().any(|g| g.eq_ignore_ascii_case(&goal)) {
                self.financial_goals.push(goal);
            }
        }
    }

    /// Profile block for the reasoning system prompt.
    pub fn summary(&self) -> String {
        if *self == UserProfile::default() {
            return "No profile information collected yet. Ask about age, risk tolerance, \
                    time horizon and financial goals before giving specific investment advice."
                .to_string();
        }

        let mut lines = Vec::new();
        if let Some(age) = self.age {
            lines.push(format!("- Age: {}", age));
        }
        if let Some(risk) = self.risk_tolerance {
            lines.push(format!("- Risk tolerance: {}", risk));
        }
        if let Some(years) = self.time_horizon_years {
            lines.push(format!("- Time horizon: {} years", years));
        }
        if !self.financial_goals.is_empty() {
            lines.push(format!("- Goals: {}", self.financial_goals.join(", ")));
        }

        let mut summary = lines.join("\n");
        if let GateDecision::Incomplete(missing) = ProfileGate::evaluate(self) {
            let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
            summary.push_str(&format!(
                "\n\nMissing information: {}. Ask about these before giving detailed investment advice.",
                names.join(", ")
            ));
        }
        summary
    }
}

/// Extract profile facts stated in a user message.
pub fn extract_profile_updates(text: &str) -> ProfileUpdate {
    let content = text.to_lowercase();
    let mut update = ProfileUpdate::default();

    for pattern in AGE_PATTERNS.iter() {
        if let Some(age) = first_number(pattern, &content) {
            if (18..=120).contains(&age) {
                update.age = Some(age);
            }
            break;
        }
    }

    update.risk_tolerance = if content.contains("risk") && content.contains("conservative") {
        Some(RiskTolerance::Conservative)
    } else if content.contains("risk") && content.contains("aggressive") {
        Some(RiskTolerance::Aggressive)
    } else if content.contains("risk") && content.contains("moderate") {
        Some(RiskTolerance::Moderate)
    } else if content.contains("i prefer conservative") || content.contains("low risk") {
        Some(RiskTolerance::Conservative)
    } else if content.contains("i prefer aggressive") || content.contains("high risk") {
        Some(RiskTolerance::Aggressive)
    } else {
        None
    };

    for pattern in HORIZON_PATTERNS.iter() {
        if let Some(years) = first_number(pattern, &content) {
            if years > 0 && years <= 100 {
                update.time_horizon_years = Some(years);
            }
            break;
        }
    }

    for (keyword, goal) in GOAL_KEYWORDS {
        if content.contains(keyword) && !update.financial_goals.iter().any(|g| g == goal) {
            update.financial_goals.push((*goal).to_string());
        }
    }
    if update.financial_goals.is_empty() {
        if let Some(stated) = GOAL_STATEMENT.captures(&content).and_then(|c| c.get(1)) {
            update.financial_goals.push(stated.as_str().trim().to_string());
        }
    }

    update
}

fn first_number(pattern: &Regex, content: &str) -> Option<u32> {
    pattern
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

//
// ================= Gate =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    Age,
    RiskTolerance,
    TimeHorizon,
    FinancialGoals,
}

impl fmt::Display for ProfileField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProfileField::Age => "age",
            ProfileField::RiskTolerance => "risk tolerance",
            ProfileField::TimeHorizon => "time horizon",
            ProfileField::FinancialGoals => "financial goals",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Complete,
    Incomplete(Vec<ProfileField>),
}

/// No advice without minimum context.
pub struct ProfileGate;

impl ProfileGate {
    pub fn evaluate(profile: &UserProfile) -> GateDecision {
        let mut missing = Vec::new();
        if profile.age.is_none() {
            missing.push(ProfileField::Age);
        }
        if profile.risk_tolerance.is_none() {
            missing.push(ProfileField::RiskTolerance);
        }
        if profile.time_horizon_years.is_none() {
            missing.push(ProfileField::TimeHorizon);
        }
        if profile.financial_goals.is_empty() {
            missing.push(ProfileField::FinancialGoals);
        }

        if missing.is_empty() {
            GateDecision::Complete
        } else {
            GateDecision::Incomplete(missing)
        }
    }

    /// Question asked instead of running the reasoning loop.
    pub fn clarifying_question(missing: &[ProfileField]) -> String {
        let asks: Vec<&str> = missing
            .iter()
            .map(|field| match field {
                ProfileField::Age => "How old are you?",
                ProfileField::RiskTolerance => {
                    "How would you describe your risk tolerance: conservative, moderate or aggressive?"
                }
                ProfileField::TimeHorizon => "How many years until you expect to need this money?",
                ProfileField::FinancialGoals => {
                    "What are you investing for (for example retirement, a home, or education)?"
                }
            })
            .collect();

        let mut question = String::from(
            "Before I can give you advice that fits your situation, I need a bit more context.\n\n",
        );
        for ask in asks {
            question.push_str("- ");
            question.push_str(ask);
            question.push('\n');
        }
        question
    }
}
