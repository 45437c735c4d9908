//! Medical Query Analyzer
//!
//! Classifies intent, screens for risk patterns, extracts medical entities,
//! detects the target population and decomposes multi-part questions.
//! Analysis never fails: ambiguous input degrades to a low-confidence
//! `Definition` classification.

use async_trait::async_trait;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use crate::cancellation::CancellationToken;
use crate::error::Service;
use crate::llm::{CompletionProvider, GenerationConfig};
use crate::rag::query_decomposer::decompose_query;
use crate::resilience::{call_with_retry, RetryPolicy};
use crate::types::{MedicalIntent, PopulationType, QueryAnalysis, RiskFlag};

// ============================================================================
// Patterns
// ============================================================================

static URGENCY_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(emergency|urgent(?:ly)?|911|999|112|ambulance|right now|critical condition|life[- ]threatening|overdosed?)\b",
    )
    .expect("urgency regex is valid")
});
/// Clinical topics that contain "emergency" without describing one.
static EMERGENCY_TOPIC_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\bemergency (?:contracepti\w*|departments?|medicine|obstetric care|care guidelines?)\b")
        .expect("emergency topic regex is valid")
});
static SELF_HARM_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(suicid\w*|kill (?:myself|me)|end (?:my|it) (?:life|all)|want to die|self[- ]harm\w*|hurt(?:ing)? myself|cut(?:ting)? myself|lethal dose|fatal dose|how to overdose)\b",
    )
    .expect("self-harm regex is valid")
});
static ACUTE_SYMPTOM_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(chest pain|crushing pain|heart attack|stroke|seizures?|seizing|unconscious|unresponsive|passed out|passing out|fainted|severe bleeding|bleeding heavily|coughing (?:up )?blood|anaphyla\w+|throat (?:is )?closing|choking|not breathing|difficulty breathing|short(?:ness)? of breath)\b",
    )
    .expect("acute symptom regex is valid")
});
/// Symptom phrasings that are already first person.
static ACUTE_FIRST_PERSON_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(can'?t breathe|cannot breathe|can not breathe|i'?m (?:bleeding|choking|dying)|i am (?:bleeding|choking|dying))\b")
        .expect("acute first-person regex is valid")
});
/// Question forms that mark a symptom mention as a topic rather than a report.
static EDUCATIONAL_FORM_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(what|which|how|why|when|guidelines?|evaluat\w*|assess\w*|criteria|work-?up|differential|prevent\w*|risk factors?|causes? of|signs? of|symptoms? of|according to|classification|epidemiology|overview)\b",
    )
    .expect("educational form regex is valid")
});
/// Requests for immediate help, which override an educational form.
static HELP_SEEKING_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(what (?:to|do i|do we|should i|should we) do|help(?: me)?|please hurry|happening now)\b")
        .expect("help seeking regex is valid")
});
static PRESENT_PERSON_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(i|i'm|i've|i am|i have|me|my|we|someone|somebody|he is|she is|he's|she's|he has|she has|my (?:son|daughter|child|baby|husband|wife|mother|father|mom|dad|partner|friend))\b",
    )
    .expect("present person regex is valid")
});
static DIAGNOSIS_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(do i have|what do i have|could i have|might i have|do you think i have|have i got|diagnose me|what'?s wrong with me|what is wrong with me|is (?:this|it) (?:cancer|serious|an infection|diabetes)|am i (?:sick|ill|diabetic|hypertensive|infected|anemic|anaemic|depressed|pregnant)|does my child have|does my (?:son|daughter|baby) have)\b",
    )
    .expect("diagnosis regex is valid")
});
static TREATMENT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(should i (?:take|use|stop|start|increase|decrease|reduce|get|try|switch|continue|be taking)|what should i (?:take|do|use)|can i (?:take|use|stop|mix)|is it (?:safe|ok|okay) for me|recommend (?:for|to) me|advise me|prescribe (?:for )?me|treat me|treatment for me|cure me|medications? for me|medicine for me|what (?:medicine|medication|drug|pill)s? should i|how (?:much|many|often) should i|how much \w+ should i)\b",
    )
    .expect("treatment regex is valid")
});
static PERSONAL_DOSAGE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(my (?:dosage|dose|doses)|how (?:much|often|many) should i|increase my|double my|skip my)\b")
        .expect("personal dosage regex is valid")
});
static MISUSE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(without (?:a )?prescription|get high|recreational(?:ly)?|my (?:prescription|medication|medications|pills)|at home abortion|abortion at home)\b")
        .expect("misuse regex is valid")
});

static CONTRAINDICATION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(contraindicat\w*|avoid(?:ed)?|not be (?:used|given|taken)|should not|shouldn'?t|unsafe|warnings?|precautions?|interact\w*|adverse effects?|side effects?|when not to)\b",
    )
    .expect("contraindication regex is valid")
});
static PROCEDURE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(how (?:is|are|do you|should|to|does one)|procedures?|steps?|techniques?|protocol|administer\w*|performed|measured|screened|monitored)\b",
    )
    .expect("procedure regex is valid")
});
static RECOMMENDATION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(recommend\w*|guidelines? (?:say|state|advise)|first[- ]line|management of|treatment (?:of|for)|treated|best practice|indicated|preferred|should (?:patients|women|children|adults|be)|target|threshold|when to start)\b",
    )
    .expect("recommendation regex is valid")
});
static DEFINITION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(what (?:is|are)|what'?s|define|definition|meaning|means|what does .+ mean|explain|describe|defined)\b")
        .expect("definition regex is valid")
});
static CONVERSATIONAL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)^(?:hi|hello|hey|greetings|good (?:morning|afternoon|evening)|thanks|thank you|thx|appreciate it|ok|okay|great|good|fine|nice|cool|awesome|bye|goodbye)(?:[\s,]+(?:there|so much|a lot|very much|you|again|all))*[\s!.,?]*$",
    )
    .expect("conversational regex is valid")
});

static PREGNANT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(pregnan\w*|expecting|maternal|antenatal|prenatal|breastfeeding|lactating)\b")
        .expect("pregnancy regex is valid")
});
static PEDIATRIC_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(child|children|pa?ediatric\w*|infants?|bab(?:y|ies)|newborns?|neonat\w*|toddlers?|adolescents?|kids?)\b")
        .expect("pediatric regex is valid")
});
static GERIATRIC_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(elderly|seniors?|geriatric|older (?:adults?|people|patients)|aged (?:65|70|75|80))\b")
        .expect("geriatric regex is valid")
});
static ADULT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(adults?)\b").expect("adult regex is valid")
});
static DRUG_CONTEXT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(dos(?:e|es|age|ing)|drugs?|medications?|medicines?|contraindicat\w*|safe(?:ty)?|avoid\w*|vaccin\w*|prescri\w*|teratogen\w*)\b")
        .expect("drug context regex is valid")
});

static ORGANIZATION_ABBREV_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(WHO|CDC|NICE|AHA|ESC|ACP|USPSTF|ADA|ACOG|IDSA)\b").expect("organization regex is valid")
});
static ORGANIZATION_NAME_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b(world health organi[sz]ation|centers? for disease control|national institute for health and care excellence|american heart association|european society of cardiology|american college of physicians|preventive services task force|american diabetes association)\b",
    )
    .expect("organization name regex is valid")
});

static DRUG_SUFFIX_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)\b[a-z]{2,}(?:mab|nib|pril|sartan|olol|statin|azole|cillin|mycin|floxacin|cycline|dipine|gliptin|gliflozin|formin|tidine|prazole|oxetine|azepam|parin|vir)\b",
    )
    .expect("drug suffix regex is valid")
});

/// Guideline bodies recognised in queries and reported by `stats()`.
pub const SUPPORTED_SOURCES: &[&str] = &["WHO", "CDC", "NICE", "AHA", "ESC", "ACP", "USPSTF"];

const CONDITION_LEXICON: &[&str] = &[
    "acute coronary syndrome", "aids", "anaemia", "anemia", "asthma", "atrial fibrillation",
    "breast cancer", "cancer", "chronic kidney disease", "copd", "covid-19", "dementia",
    "depression", "diabetes", "eclampsia", "epilepsy", "gestational diabetes", "heart failure",
    "hepatitis b", "hepatitis c", "hiv", "hyperlipidaemia", "hyperlipidemia", "hypertension",
    "influenza", "malaria", "measles", "myocardial infarction", "obesity", "osteoporosis",
    "pneumonia", "postpartum haemorrhage", "postpartum hemorrhage", "pre-eclampsia",
    "preeclampsia", "sepsis", "stroke", "tuberculosis", "type 1 diabetes", "type 2 diabetes",
];

const INTERVENTION_LEXICON: &[&str] = &[
    "acetaminophen", "antibiotics", "antiretroviral", "antiretroviral therapy", "aspirin",
    "blood pressure", "chemotherapy", "folic acid", "heparin", "ibuprofen", "insulin",
    "iron supplementation", "magnesium sulfate", "magnesium sulphate", "medication",
    "metformin", "oxytocin", "paracetamol", "statins", "surgery", "vaccination", "vaccine",
    "warfarin",
];

// ============================================================================
// Classification
// ============================================================================

/// Intent decision with the classifier's confidence in it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub intent: MedicalIntent,
    pub confidence: f32,
}

/// Black-box intent classifier.
#[async_trait]
pub trait QueryClassifier: Send + Sync {
    /// Never fails; implementations degrade to a rule-based result.
    async fn classify(&self, query: &str, risk_flags: &BTreeSet<RiskFlag>, cancel: &CancellationToken) -> Classification;
}

/// Deterministic pattern classifier, checked in a fixed priority order.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedClassifier;

impl RuleBasedClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify_rules(&self, query: &str, risk_flags: &BTreeSet<RiskFlag>) -> Classification {
        let folded = fold_apostrophes(query);
        let trimmed = folded.trim();

        if risk_flags.contains(&RiskFlag::EmergencyLanguage) || risk_flags.contains(&RiskFlag::SelfHarm) {
            return classified(MedicalIntent::Emergency, 0.95);
        }
        if risk_flags.contains(&RiskFlag::SelfDiagnosis) {
            return classified(MedicalIntent::DiagnosisRequest, 0.9);
        }
        if risk_flags.contains(&RiskFlag::PersonalTreatment) && TREATMENT_RE.is_match(trimmed) {
            return classified(MedicalIntent::TreatmentAdviceRequest, 0.9);
        }

        if CONTRAINDICATION_RE.is_match(trimmed) {
            return classified(MedicalIntent::Contraindication, 0.8);
        }
        if PROCEDURE_RE.is_match(trimmed) {
            return classified(MedicalIntent::Procedure, 0.75);
        }
        if RECOMMENDATION_RE.is_match(trimmed) {
            return classified(MedicalIntent::Recommendation, 0.8);
        }
        if DEFINITION_RE.is_match(trimmed) {
            return classified(MedicalIntent::Definition, 0.8);
        }

        if CONVERSATIONAL_RE.is_match(trimmed) {
            return classified(MedicalIntent::Conversational, 0.95);
        }

        if risk_flags.contains(&RiskFlag::PersonalDosage) || risk_flags.contains(&RiskFlag::PersonalTreatment) {
            return classified(MedicalIntent::UnsafeOther, 0.7);
        }

        // Ambiguous input: safe educational default, low confidence
        classified(MedicalIntent::Definition, 0.3)
    }
}

fn classified(intent: MedicalIntent, confidence: f32) -> Classification {
    Classification { intent, confidence }
}

#[async_trait]
impl QueryClassifier for RuleBasedClassifier {
    async fn classify(&self, query: &str, risk_flags: &BTreeSet<RiskFlag>, _cancel: &CancellationToken) -> Classification {
        self.classify_rules(query, risk_flags)
    }
}

/// Asks the completion service for a one-word intent label.
///
/// Falls back to the rule-based result on any failure, and never lets the
/// model downgrade an intent the rules consider safety-critical.
pub struct ModelBackedClassifier {
    provider: Arc<dyn CompletionProvider>,
    rules: RuleBasedClassifier,
    retry: RetryPolicy,
}

impl ModelBackedClassifier {
    pub fn new(provider: Arc<dyn CompletionProvider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            rules: RuleBasedClassifier::new(),
            retry,
        }
    }

    fn prompt(query: &str) -> String {
        format!(
            "Classify the medical question into exactly one label.\n\
             Labels:\n\
             emergency - acute symptoms or urgent danger\n\
             diagnosis_request - asks whether the user has a condition\n\
             treatment_advice_request - asks what the user personally should take or do\n\
             definition - asks what something is\n\
             recommendation - asks what guidelines recommend\n\
             contraindication - asks when something should be avoided\n\
             procedure - asks how something is done\n\
             conversational - greeting or acknowledgment\n\
             unsafe_other - any other request for personal medical advice\n\n\
             Question: {}\n\
             Answer with the label only.\nLabel:",
            query
        )
    }

    /// First recognisable label in the model output.
    pub fn parse_label(output: &str) -> Option<MedicalIntent> {
        output
            .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
            .filter(|w| !w.is_empty())
            .find_map(MedicalIntent::from_label)
    }
}

#[async_trait]
impl QueryClassifier for ModelBackedClassifier {
    async fn classify(&self, query: &str, risk_flags: &BTreeSet<RiskFlag>, cancel: &CancellationToken) -> Classification {
        let fallback = self.rules.classify_rules(query, risk_flags);
        if fallback.intent.is_refused_outright() {
            return fallback;
        }

        let prompt = Self::prompt(query);
        let config = GenerationConfig::for_classification();
        let provider = self.provider.clone();
        let result = call_with_retry(&self.retry, Service::Classifier, cancel, || {
            let provider = provider.clone();
            let prompt = prompt.clone();
            let config = config.clone();
            async move { provider.complete(&prompt, &config).await }
        })
        .await;

        match result {
            Ok(output) => match Self::parse_label(&output) {
                Some(intent) => {
                    tracing::debug!(intent = ?intent, rule_intent = ?fallback.intent, "Model classification");
                    Classification {
                        intent,
                        confidence: 0.85,
                    }
                }
                None => {
                    tracing::warn!(output_len = output.len(), "Unparseable classifier output, using rule-based intent");
                    fallback
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Classifier call failed, using rule-based intent");
                fallback
            }
        }
    }
}

// ============================================================================
// Query Analyzer - Main Entry Point
// ============================================================================

pub struct QueryAnalyzer {
    classifier: Arc<dyn QueryClassifier>,
}

impl QueryAnalyzer {
    pub fn new(classifier: Arc<dyn QueryClassifier>) -> Self {
        Self { classifier }
    }

    pub fn rule_based() -> Self {
        Self::new(Arc::new(RuleBasedClassifier::new()))
    }

    pub async fn analyze(&self, query: &str, cancel: &CancellationToken) -> QueryAnalysis {
        let risk_flags = detect_risk_flags(query);
        let classification = self.classifier.classify(query, &risk_flags, cancel).await;
        let decomposition = decompose_query(query);

        let analysis = QueryAnalysis {
            query: query.to_string(),
            intent: classification.intent,
            classification_confidence: classification.confidence,
            risk_flags,
            entities: extract_entities(query),
            population_hint: detect_population(query),
            organization_hint: detect_organization(query),
            sub_queries: decomposition.sub_queries,
        };

        tracing::debug!(
            intent = ?analysis.intent,
            confidence = analysis.classification_confidence,
            risk_flags = ?analysis.risk_flags,
            entities = analysis.entities.len(),
            sub_queries = analysis.sub_queries.len(),
            "Query analyzed"
        );
        analysis
    }
}

impl Default for QueryAnalyzer {
    fn default() -> Self {
        Self::rule_based()
    }
}

// ============================================================================
// Detectors
// ============================================================================

/// Risk screening, independent of intent classification.
pub fn detect_risk_flags(query: &str) -> BTreeSet<RiskFlag> {
    let mut flags = BTreeSet::new();
    let folded = fold_apostrophes(query);
    let query = folded.as_ref();

    let screened = EMERGENCY_TOPIC_RE.replace_all(query, "");
    if URGENCY_RE.is_match(&screened) || ACUTE_FIRST_PERSON_RE.is_match(query) || reports_acute_symptom(query) {
        flags.insert(RiskFlag::EmergencyLanguage);
    }
    if SELF_HARM_RE.is_match(query) {
        flags.insert(RiskFlag::SelfHarm);
    }
    if DIAGNOSIS_RE.is_match(query) {
        flags.insert(RiskFlag::SelfDiagnosis);
    }
    if TREATMENT_RE.is_match(query) || MISUSE_RE.is_match(query) {
        flags.insert(RiskFlag::PersonalTreatment);
    }
    if PERSONAL_DOSAGE_RE.is_match(query) {
        flags.insert(RiskFlag::PersonalDosage);
    }

    let special_population = PREGNANT_RE.is_match(query) || PEDIATRIC_RE.is_match(query) || GERIATRIC_RE.is_match(query);
    if special_population && DRUG_CONTEXT_RE.is_match(query) {
        flags.insert(RiskFlag::PopulationSpecific);
    }

    flags
}

/// An acute symptom counts as reported unless the query only asks about it
/// as a topic: a bare "chest pain" is an emergency, "chest pain evaluation
/// criteria" is not.
fn reports_acute_symptom(query: &str) -> bool {
    if !ACUTE_SYMPTOM_RE.is_match(query) {
        return false;
    }
    PRESENT_PERSON_RE.is_match(query) || HELP_SEEKING_RE.is_match(query) || !EDUCATIONAL_FORM_RE.is_match(query)
}

/// Typographic apostrophes as typed on phones and word processors.
fn fold_apostrophes(query: &str) -> Cow<'_, str> {
    if query.contains(['\u{2018}', '\u{2019}', '\u{02BC}', '\u{2032}']) {
        Cow::Owned(query.replace(['\u{2018}', '\u{2019}', '\u{02BC}', '\u{2032}'], "'"))
    } else {
        Cow::Borrowed(query)
    }
}

/// Target population, most specific first. `None` when nothing is mentioned.
pub fn detect_population(query: &str) -> Option<PopulationType> {
    if PREGNANT_RE.is_match(query) {
        Some(PopulationType::Pregnant)
    } else if PEDIATRIC_RE.is_match(query) {
        Some(PopulationType::Pediatric)
    } else if GERIATRIC_RE.is_match(query) {
        Some(PopulationType::Geriatric)
    } else if ADULT_RE.is_match(query) {
        Some(PopulationType::Adult)
    } else {
        None
    }
}

/// Canonical abbreviation of a guideline body named in the query.
pub fn detect_organization(query: &str) -> Option<String> {
    if let Some(m) = ORGANIZATION_ABBREV_RE.find(query) {
        return Some(m.as_str().to_string());
    }
    let name = ORGANIZATION_NAME_RE.find(query)?.as_str().to_lowercase();
    let abbrev = if name.starts_with("world health") {
        "WHO"
    } else if name.starts_with("center") {
        "CDC"
    } else if name.starts_with("national institute") {
        "NICE"
    } else if name.starts_with("american heart") {
        "AHA"
    } else if name.starts_with("european society") {
        "ESC"
    } else if name.starts_with("american college") {
        "ACP"
    } else if name.starts_with("preventive") {
        "USPSTF"
    } else {
        "ADA"
    };
    Some(abbrev.to_string())
}

/// Medical terms in first-occurrence order. Longer lexicon entries win over
/// entries nested inside them ("type 2 diabetes" over "diabetes").
pub fn extract_entities(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    for term in CONDITION_LEXICON.iter().chain(INTERVENTION_LEXICON.iter()) {
        let mut from = 0;
        while let Some(pos) = lower[from..].find(term) {
            let start = from + pos;
            let end = start + term.len();
            if is_word_boundary(&lower, start, end) {
                spans.push((start, end));
            }
            from = end;
        }
    }
    for m in DRUG_SUFFIX_RE.find_iter(&lower) {
        spans.push((m.start(), m.end()));
    }

    // Earliest first, longest first at the same position
    spans.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));

    let mut accepted: Vec<(usize, usize)> = Vec::new();
    let mut entities: Vec<String> = Vec::new();
    for (start, end) in spans {
        if accepted.iter().any(|&(s, e)| start >= s && end <= e) {
            continue;
        }
        accepted.push((start, end));
        let entity = lower[start..end].to_string();
        if !entities.contains(&entity) {
            entities.push(entity);
        }
    }
    entities
}

fn is_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedCompletion;

    fn rules(query: &str) -> MedicalIntent {
        RuleBasedClassifier::new()
            .classify_rules(query, &detect_risk_flags(query))
            .intent
    }

    #[test]
    fn test_safety_intents_take_priority() {
        assert_eq!(rules("I have crushing chest pain and my left arm is numb"), MedicalIntent::Emergency);
        assert_eq!(rules("I can't breathe"), MedicalIntent::Emergency);
        assert_eq!(rules("I want to kill myself"), MedicalIntent::Emergency);
        assert_eq!(rules("Do I have diabetes? What is HbA1c?"), MedicalIntent::DiagnosisRequest);
        assert_eq!(rules("Should I take metformin?"), MedicalIntent::TreatmentAdviceRequest);
        assert_eq!(rules("How much insulin should I inject?"), MedicalIntent::TreatmentAdviceRequest);
    }

    #[test]
    fn test_educational_intents() {
        assert_eq!(rules("What is hypertension according to WHO guidelines?"), MedicalIntent::Definition);
        assert_eq!(rules("What does NICE recommend for type 2 diabetes?"), MedicalIntent::Recommendation);
        assert_eq!(rules("When should ACE inhibitors be avoided?"), MedicalIntent::Contraindication);
        assert_eq!(rules("How is blood pressure measured in children?"), MedicalIntent::Procedure);
        // A symptom asked about as a topic is not an emergency
        assert_eq!(
            rules("What does the guideline say about chest pain evaluation?"),
            MedicalIntent::Recommendation
        );
        assert_eq!(rules("What is emergency contraception?"), MedicalIntent::Definition);
        assert_eq!(rules("What are the risk factors for stroke?"), MedicalIntent::Definition);
    }

    #[test]
    fn test_bare_acute_symptoms_are_emergencies() {
        assert_eq!(rules("chest pain"), MedicalIntent::Emergency);
        assert_eq!(rules("severe chest pain"), MedicalIntent::Emergency);
        assert_eq!(rules("crushing chest pain radiating to left arm"), MedicalIntent::Emergency);
        assert_eq!(rules("chest pain what to do"), MedicalIntent::Emergency);
        assert!(detect_risk_flags("stroke symptoms right side numb").contains(&RiskFlag::EmergencyLanguage));
    }

    #[test]
    fn test_typographic_apostrophes_are_folded() {
        assert_eq!(rules("can\u{2019}t breathe"), MedicalIntent::Emergency);
        assert_eq!(rules("I\u{2019}m choking"), MedicalIntent::Emergency);
        assert_eq!(rules("what\u{2019}s wrong with me"), MedicalIntent::DiagnosisRequest);
        assert!(matches!(fold_apostrophes("plain text"), Cow::Borrowed("plain text")));
    }

    #[test]
    fn test_conversational_is_anchored() {
        assert_eq!(rules("Hi"), MedicalIntent::Conversational);
        assert_eq!(rules("thank you so much!"), MedicalIntent::Conversational);
        assert_eq!(rules("Hi, what is anaemia?"), MedicalIntent::Definition);
    }

    #[test]
    fn test_unsafe_other_and_ambiguous_default() {
        assert_eq!(rules("Is my dose of 20mg lisinopril too high"), MedicalIntent::UnsafeOther);
        assert_eq!(rules("buy tramadol without prescription"), MedicalIntent::UnsafeOther);

        let c = RuleBasedClassifier::new().classify_rules("hypertension", &BTreeSet::new());
        assert_eq!(c.intent, MedicalIntent::Definition);
        assert!(c.confidence < 0.5);
    }

    #[test]
    fn test_risk_flags_are_independent_of_intent() {
        let flags = detect_risk_flags("Which antihypertensive drugs are contraindicated in pregnancy?");
        assert!(flags.contains(&RiskFlag::PopulationSpecific));
        assert_eq!(
            rules("Which antihypertensive drugs are contraindicated in pregnancy?"),
            MedicalIntent::Contraindication
        );
        assert!(detect_risk_flags("What is hypertension?").is_empty());
    }

    #[test]
    fn test_population_and_organization_detection() {
        assert_eq!(detect_population("aspirin in pregnant women"), Some(PopulationType::Pregnant));
        assert_eq!(detect_population("fever in infants"), Some(PopulationType::Pediatric));
        assert_eq!(detect_population("falls in older adults"), Some(PopulationType::Geriatric));
        assert_eq!(detect_population("What is hypertension?"), None);

        assert_eq!(detect_organization("What is hypertension according to WHO guidelines?").as_deref(), Some("WHO"));
        assert_eq!(detect_organization("who should be screened?"), None);
        assert_eq!(
            detect_organization("per the World Health Organization").as_deref(),
            Some("WHO")
        );
    }

    #[test]
    fn test_entity_extraction_order_and_nesting() {
        let entities = extract_entities("Is metformin or insulin preferred for type 2 diabetes with hypertension?");
        assert_eq!(entities, vec!["metformin", "insulin", "type 2 diabetes", "hypertension"]);

        let entities = extract_entities("lisinopril and losartan in chronic kidney disease");
        assert_eq!(entities, vec!["lisinopril", "losartan", "chronic kidney disease"]);

        assert!(extract_entities("hypertensive crisis").is_empty());
    }

    #[tokio::test]
    async fn test_analyze_builds_complete_analysis() {
        let analyzer = QueryAnalyzer::rule_based();
        let analysis = analyzer
            .analyze("What is hypertension according to WHO guidelines?", &CancellationToken::new())
            .await;
        assert_eq!(analysis.intent, MedicalIntent::Definition);
        assert_eq!(analysis.entities, vec!["hypertension"]);
        assert_eq!(analysis.organization_hint.as_deref(), Some("WHO"));
        assert!(analysis.sub_queries.is_empty());
        assert!(analysis.population_hint.is_none());
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(ModelBackedClassifier::parse_label("recommendation"), Some(MedicalIntent::Recommendation));
        assert_eq!(ModelBackedClassifier::parse_label("Label: Procedure."), Some(MedicalIntent::Procedure));
        assert_eq!(ModelBackedClassifier::parse_label("I think so"), None);
    }

    #[tokio::test]
    async fn test_model_classifier_uses_model_label() {
        let provider = Arc::new(ScriptedCompletion::new(vec!["contraindication"]));
        let classifier = ModelBackedClassifier::new(provider.clone(), RetryPolicy::default());
        let query = "Tell me about aspirin in peptic ulcer disease";
        let result = classifier
            .classify(query, &detect_risk_flags(query), &CancellationToken::new())
            .await;
        assert_eq!(result.intent, MedicalIntent::Contraindication);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_classifier_never_downgrades_safety_intent() {
        let provider = Arc::new(ScriptedCompletion::new(vec!["definition"]));
        let classifier = ModelBackedClassifier::new(provider.clone(), RetryPolicy::default());
        let query = "Should I take metformin?";
        let result = classifier
            .classify(query, &detect_risk_flags(query), &CancellationToken::new())
            .await;
        assert_eq!(result.intent, MedicalIntent::TreatmentAdviceRequest);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_model_classifier_falls_back_on_garbage_and_errors() {
        let provider = Arc::new(ScriptedCompletion::new(vec!["banana"]));
        let classifier = ModelBackedClassifier::new(provider, RetryPolicy::default());
        let query = "What is anaemia?";
        let result = classifier
            .classify(query, &detect_risk_flags(query), &CancellationToken::new())
            .await;
        assert_eq!(result.intent, MedicalIntent::Definition);

        let failing = Arc::new(crate::test_support::FailingCompletion::fatal());
        let classifier = ModelBackedClassifier::new(failing, RetryPolicy::default());
        let result = classifier
            .classify(query, &detect_risk_flags(query), &CancellationToken::new())
            .await;
        assert_eq!(result.intent, MedicalIntent::Definition);
    }
}
