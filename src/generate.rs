//! Question generation pipeline.
//!
//! Drives a candidate question through build-prompt → call-model → parse →
//! syntax validation → semantic validation, looping back through a
//! corrective repair prompt on failure. Every transition out of a
//! validation stage carries a structured [`FailureReason`]; the repair
//! prompt is built from it, and the reason of the final failed attempt is
//! recorded on the deterministic fallback question.
//!
//! The pipeline never returns an error to the caller: transient provider
//! failures, malformed output, and retry exhaustion all degrade to the
//! fallback path, which synthesizes a citation-backed question from the
//! top-ranked passages without any model involvement.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::completion::{FormatHint, TextCompletionProvider};
use crate::config::GenerationConfig;
use crate::models::{
    Citation, CitationTag, Explanation, FallbackInfo, GeneratedQuestion, OptionLetter, Passage,
    Question, QuestionKind, QuestionMeta, YnAnswer,
};
use crate::textutil::{
    count_tags, ensure_rationale, extract_json, filter_citations, flatten_passages,
    force_single_tag, looks_like_header, parse_leading_tag, parse_tags, squash_whitespace,
    strip_tags, truncate_chars, FlattenedContext, MIN_RATIONALE_CHARS, SNIPPET_MAX_CHARS,
};

/// Structured reason a candidate failed a pipeline stage.
///
/// Consumed by the corrective-prompt builder and surfaced verbatim in the
/// fallback debug marker.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Provider error or empty output.
    NoResponse,
    /// No JSON object could be extracted from the model text.
    NoJson,
    MissingStem,
    /// "List/enumerate"-style stems invite ambiguous option sets.
    StemTooBroad,
    /// Stems referring to "the cited passage" test nothing.
    StemTooMeta,
    /// Yes/no answer was not YES or NO.
    BadAnswer,
    OptionsNotFour,
    EmptyOption,
    DuplicateOptions,
    /// The option set matches the banned generic meta-option pattern.
    MetaOptions,
    /// Multiple-choice answer did not normalize to a..d.
    BadAnswerLetter,
    MissingExplanation,
    /// Explanation carried the wrong number of citation tags.
    WrongTagCount(usize),
    RationaleTooShort,
    /// Checker found zero or several correct options.
    SemanticAmbiguous(Vec<String>),
    /// Checker found one correct option, but not the candidate's.
    SemanticMismatch { expected: String, got: String },
    /// Candidate passed, but post-processing broke a syntax rule again.
    PostRepairInvalid(Box<FailureReason>),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoResponse => write!(f, "model returned no usable response"),
            FailureReason::NoJson => write!(f, "no JSON object in model output"),
            FailureReason::MissingStem => write!(f, "missing stem"),
            FailureReason::StemTooBroad => {
                write!(f, "stem too broad (use one specific fact or definition)")
            }
            FailureReason::StemTooMeta => {
                write!(f, "stem too meta (do not ask about 'the cited passage')")
            }
            FailureReason::BadAnswer => write!(f, "answer must be YES or NO"),
            FailureReason::OptionsNotFour => write!(f, "options must be a list of 4 strings"),
            FailureReason::EmptyOption => write!(f, "empty option"),
            FailureReason::DuplicateOptions => write!(f, "options must be unique"),
            FailureReason::MetaOptions => {
                write!(f, "options too generic (meta-options are not allowed)")
            }
            FailureReason::BadAnswerLetter => write!(f, "answer must be a|b|c|d"),
            FailureReason::MissingExplanation => write!(f, "missing explanation"),
            FailureReason::WrongTagCount(n) => write!(
                f,
                "explanation must contain exactly one [source|p.N] tag, found {}",
                n
            ),
            FailureReason::RationaleTooShort => {
                write!(f, "explanation too short (needs rationale text after the tag)")
            }
            FailureReason::SemanticAmbiguous(letters) => write!(
                f,
                "checker expected exactly 1 correct option, got [{}]",
                letters.join(", ")
            ),
            FailureReason::SemanticMismatch { expected, got } => write!(
                f,
                "checker disagrees with the answer: expected={} got={}",
                expected, got
            ),
            FailureReason::PostRepairInvalid(inner) => {
                write!(f, "post-processing validation failed: {}", inner)
            }
        }
    }
}

static BROAD_STEM_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(what are|list|name all|enumerate|give all)\b").unwrap());

static OPTION_PREFIX_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-dA-D]\s*[)\].:\-]\s*").unwrap());

static ANSWER_LETTER_RX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([a-d])\b").unwrap());

static TEXT_LETTER_RX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([a-d])\b").unwrap());

/// Banned generic meta-options: a model that cannot find a concrete fact
/// tends to emit this exact set, which makes the question unanswerable
/// without the excerpts in front of you.
const GENERIC_META_OPTIONS: [&str; 4] = [
    "A statement consistent with the excerpts",
    "A statement contradicting the excerpts",
    "A statement unrelated to the excerpts",
    "A statement not directly supported by the excerpts",
];

/// Fixed distractors for the multiple-choice fallback: wrong but
/// content-bearing, never meta.
const FALLBACK_DISTRACTORS: [&str; 3] = [
    "The approach described relies on a single technique applied in isolation.",
    "The steps involved run simultaneously rather than in sequence.",
    "The material states the process continues without any terminating condition.",
];

/// Generate one question of the requested kind from ranked passages.
///
/// Always returns a valid question; when the retry budget is exhausted the
/// deterministic fallback fires and the result carries a [`FallbackInfo`]
/// naming the last failure.
#[allow(clippy::too_many_arguments)]
pub async fn generate_question(
    provider: &dyn TextCompletionProvider,
    config: &GenerationConfig,
    passages: &[Passage],
    kind: QuestionKind,
    topic: Option<&str>,
    difficulty: Option<&str>,
    variant: u32,
    avoid_stems: &[String],
) -> GeneratedQuestion {
    let ctx = flatten_passages(passages, config.context_cap_chars);
    let meta = QuestionMeta::new(topic, difficulty);

    match kind {
        QuestionKind::YesNo => generate_yn(provider, config, &ctx, meta, variant, avoid_stems).await,
        QuestionKind::MultipleChoice => {
            generate_mcq(provider, config, &ctx, meta, variant, avoid_stems).await
        }
    }
}

// ============ Yes/no generation ============

struct YnDraft {
    stem: String,
    answer: YnAnswer,
    explanation: String,
}

async fn generate_yn(
    provider: &dyn TextCompletionProvider,
    config: &GenerationConfig,
    ctx: &FlattenedContext,
    meta: QuestionMeta,
    variant: u32,
    avoid_stems: &[String],
) -> GeneratedQuestion {
    let base_prompt = yn_base_prompt(&ctx.body, &meta.difficulty, variant, avoid_stems);
    let mut prompt = base_prompt.clone();
    let mut last_reason = FailureReason::NoResponse;

    for _attempt in 0..config.yn_attempts {
        let outcome = yn_attempt(provider, ctx, &prompt).await;

        match outcome {
            Ok(mut draft) => {
                let citations = filter_citations(&draft.explanation, &ctx.citations);
                draft.explanation = ensure_rationale(&draft.explanation, &citations);

                // Post-processing can reintroduce a bare tag; check again.
                match validate_yn_draft(&draft) {
                    Ok(()) => {
                        return assemble(
                            Question::YesNo {
                                stem: draft.stem,
                                answer: draft.answer,
                                explanation: split_explanation(&draft.explanation),
                            },
                            meta,
                            citations,
                            None,
                        );
                    }
                    Err(reason) => {
                        last_reason = FailureReason::PostRepairInvalid(Box::new(reason));
                    }
                }
            }
            Err(reason) => last_reason = reason,
        }

        prompt = format!(
            "FIX THE OUTPUT. Return ONLY valid JSON. Problem: {}. \
             Remember: answer=\"YES\"/\"NO\", the explanation has exactly one \
             [source|p.N] tag followed by at least one sentence of rationale.\n\n{}",
            last_reason, base_prompt
        );
    }

    yn_fallback(ctx, meta, last_reason)
}

/// One model attempt: call, parse, normalize tags, validate, semantically
/// verify. A checker disagreement does not reject a yes/no candidate; the
/// answer is overwritten and the explanation rewritten to stay consistent.
async fn yn_attempt(
    provider: &dyn TextCompletionProvider,
    ctx: &FlattenedContext,
    prompt: &str,
) -> Result<YnDraft, FailureReason> {
    let response = provider
        .generate(prompt, Some(FormatHint::Json))
        .await
        .map_err(|_| FailureReason::NoResponse)?;

    let obj = extract_json(&response).ok_or(FailureReason::NoJson)?;
    let mut draft = parse_yn_object(&obj, &ctx.citations)?;
    validate_yn_draft(&draft)?;

    if let Some(checked) = semantic_check_yn(provider, &ctx.body, &draft.stem).await {
        if checked != draft.answer {
            draft.answer = checked;
            draft.explanation = align_yn_explanation(&draft.explanation, checked);
        }
    }

    Ok(draft)
}

fn parse_yn_object(
    obj: &serde_json::Value,
    citations: &[Citation],
) -> Result<YnDraft, FailureReason> {
    let stem = obj
        .get("stem")
        .and_then(|s| s.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if stem.is_empty() {
        return Err(FailureReason::MissingStem);
    }

    let answer = obj
        .get("answer")
        .and_then(|a| a.as_str())
        .and_then(YnAnswer::parse)
        .ok_or(FailureReason::BadAnswer)?;

    let raw_expl = obj
        .get("explanation")
        .and_then(|e| e.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if raw_expl.is_empty() {
        return Err(FailureReason::MissingExplanation);
    }

    let explanation = force_single_tag(&ensure_rationale(raw_expl, citations), citations);

    Ok(YnDraft {
        stem: stem.to_string(),
        answer,
        explanation,
    })
}

fn validate_yn_draft(draft: &YnDraft) -> Result<(), FailureReason> {
    let tags = count_tags(&draft.explanation);
    if tags != 1 {
        return Err(FailureReason::WrongTagCount(tags));
    }
    if strip_tags(&draft.explanation).chars().count() < MIN_RATIONALE_CHARS {
        return Err(FailureReason::RationaleTooShort);
    }
    Ok(())
}

/// Rewrite a yes/no explanation after the checker overruled the answer,
/// keeping the citation tag.
fn align_yn_explanation(explanation: &str, answer: YnAnswer) -> String {
    let tag = parse_tags(explanation)
        .into_iter()
        .next()
        .map(|t| t.render())
        .unwrap_or_default();

    match answer {
        YnAnswer::Yes => {
            let mut rest = strip_tags(explanation);
            if rest.chars().count() < MIN_RATIONALE_CHARS {
                rest = "The statement follows directly from the cited passage.".to_string();
            }
            format!("{} {}", tag, rest).trim().to_string()
        }
        YnAnswer::No => format!(
            "{} The cited passage does not clearly support this statement, \
             so it does not follow from the material.",
            tag
        )
        .trim()
        .to_string(),
    }
}

/// Independent checker: decide YES/NO from the excerpts alone. Returns
/// `None` when the checker output stays unparseable after a relaxed and a
/// strict attempt; the caller then skips semantic validation rather than
/// rejecting the candidate.
async fn semantic_check_yn(
    provider: &dyn TextCompletionProvider,
    body: &str,
    stem: &str,
) -> Option<YnAnswer> {
    for strict in [false, true] {
        let prompt = yn_check_prompt(body, stem, strict);
        let Ok(response) = provider.generate(&prompt, Some(FormatHint::Json)).await else {
            return None;
        };

        if let Some(obj) = extract_json(&response) {
            if let Some(ans) = obj
                .get("answer")
                .and_then(|a| a.as_str())
                .and_then(YnAnswer::parse)
            {
                return Some(ans);
            }
        }

        let upper = response.to_uppercase();
        let has_yes = upper.contains("YES");
        let has_no = upper.contains("NO");
        if has_yes != has_no {
            return Some(if has_yes { YnAnswer::Yes } else { YnAnswer::No });
        }
    }

    None
}

fn yn_fallback(
    ctx: &FlattenedContext,
    meta: QuestionMeta,
    last_reason: FailureReason,
) -> GeneratedQuestion {
    let seed = fallback_seed(ctx);

    let stem = format!(
        "According to the material, is the following statement correct: \"{}\"?",
        seed.claim
    );
    let explanation = Explanation {
        tag: seed.tag.clone(),
        rationale: "This statement is quoted in the cited passage.".to_string(),
    };

    assemble(
        Question::YesNo {
            stem,
            answer: YnAnswer::Yes,
            explanation,
        },
        meta,
        vec![Citation {
            source: seed.tag.source,
            page: seed.tag.page,
            quote: seed.quote,
        }],
        Some(FallbackInfo {
            reason: last_reason.to_string(),
        }),
    )
}

// ============ Multiple-choice generation ============

struct McqDraft {
    stem: String,
    options: [String; 4],
    answer: OptionLetter,
    explanation: String,
}

async fn generate_mcq(
    provider: &dyn TextCompletionProvider,
    config: &GenerationConfig,
    ctx: &FlattenedContext,
    meta: QuestionMeta,
    variant: u32,
    avoid_stems: &[String],
) -> GeneratedQuestion {
    let base_prompt = mcq_base_prompt(&ctx.body, &meta.difficulty, variant, avoid_stems);
    let mut prompt = base_prompt.clone();
    let mut last_reason = FailureReason::NoResponse;

    for attempt in 0..config.mcq_attempts {
        match mcq_attempt(provider, ctx, &prompt).await {
            Ok(draft) => {
                let citations = filter_citations(&draft.explanation, &ctx.citations);
                let explanation = ensure_rationale(&draft.explanation, &citations);

                return assemble(
                    Question::MultipleChoice {
                        stem: draft.stem,
                        options: draft.options,
                        answer: draft.answer,
                        explanation: split_explanation(&explanation),
                    },
                    meta,
                    citations,
                    None,
                );
            }
            Err(reason) => last_reason = reason,
        }

        // First repair targets the same fact; later repairs ask for a
        // different fact entirely to escape a repeated-failure loop.
        prompt = if attempt == 0 {
            format!(
                "FIX THE OUTPUT. Return ONLY valid JSON matching the schema. \
                 Problem: {}. Remember: 4 unique options, answer=a|b|c|d, \
                 the explanation has exactly one tag.\n\n{}",
                last_reason, base_prompt
            )
        } else {
            format!(
                "Generate a COMPLETELY DIFFERENT question (a different fact from \
                 the excerpts), because the previous one had a problem: {}. \
                 Make sure exactly one option is true.\n\n{}",
                last_reason, base_prompt
            )
        };
    }

    mcq_fallback(ctx, meta, last_reason)
}

async fn mcq_attempt(
    provider: &dyn TextCompletionProvider,
    ctx: &FlattenedContext,
    prompt: &str,
) -> Result<McqDraft, FailureReason> {
    let response = provider
        .generate(prompt, Some(FormatHint::Json))
        .await
        .map_err(|_| FailureReason::NoResponse)?;

    let obj = extract_json(&response).ok_or(FailureReason::NoJson)?;
    let draft = parse_mcq_object(&obj, &ctx.citations)?;

    match semantic_check_mcq(provider, &ctx.body, &draft).await {
        SemanticOutcome::Pass | SemanticOutcome::Skip => Ok(draft),
        SemanticOutcome::Fail(reason) => Err(reason),
    }
}

fn parse_mcq_object(
    obj: &serde_json::Value,
    citations: &[Citation],
) -> Result<McqDraft, FailureReason> {
    let stem = obj
        .get("stem")
        .and_then(|s| s.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if stem.is_empty() {
        return Err(FailureReason::MissingStem);
    }
    if BROAD_STEM_RX.is_match(stem) {
        return Err(FailureReason::StemTooBroad);
    }
    let lower = stem.to_lowercase();
    if lower.contains("cited passage") || lower.contains("cited excerpt") {
        return Err(FailureReason::StemTooMeta);
    }

    let raw_options = obj
        .get("options")
        .and_then(|o| o.as_array())
        .ok_or(FailureReason::OptionsNotFour)?;
    if raw_options.len() != 4 {
        return Err(FailureReason::OptionsNotFour);
    }

    let mut options: Vec<String> = Vec::with_capacity(4);
    for raw in raw_options {
        let s = raw.as_str().ok_or(FailureReason::OptionsNotFour)?;
        let cleaned = squash_whitespace(&OPTION_PREFIX_RX.replace(s.trim(), ""));
        if cleaned.is_empty() {
            return Err(FailureReason::EmptyOption);
        }
        options.push(cleaned);
    }

    let mut lowered: Vec<String> = options.iter().map(|o| o.to_lowercase()).collect();
    lowered.sort();
    lowered.dedup();
    if lowered.len() != 4 {
        return Err(FailureReason::DuplicateOptions);
    }

    if is_generic_meta_options(&options) {
        return Err(FailureReason::MetaOptions);
    }

    let answer = obj
        .get("answer")
        .and_then(|a| a.as_str())
        .and_then(normalize_answer_letter)
        .ok_or(FailureReason::BadAnswerLetter)?;

    let raw_expl = obj
        .get("explanation")
        .and_then(|e| e.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if raw_expl.is_empty() {
        return Err(FailureReason::MissingExplanation);
    }

    let explanation = force_single_tag(&ensure_rationale(raw_expl, citations), citations);
    let tags = count_tags(&explanation);
    if tags != 1 {
        return Err(FailureReason::WrongTagCount(tags));
    }
    if strip_tags(&explanation).chars().count() < MIN_RATIONALE_CHARS {
        return Err(FailureReason::RationaleTooShort);
    }

    let options: [String; 4] = options.try_into().expect("length checked above");

    Ok(McqDraft {
        stem: stem.to_string(),
        options,
        answer,
        explanation,
    })
}

/// Normalize an answer like `"b"`, `"B)"`, or `"b. because"` to a letter.
fn normalize_answer_letter(raw: &str) -> Option<OptionLetter> {
    let lowered = raw.trim().to_lowercase();
    let cap = ANSWER_LETTER_RX.captures(&lowered)?;
    cap[1].chars().next().and_then(OptionLetter::from_letter)
}

fn normalize_option(option: &str) -> String {
    squash_whitespace(&option.to_lowercase().replace(['"', '\'', '„', '”'], ""))
}

/// Detect the banned generic meta-option set: exact normalized match, or a
/// fuzzy token-overlap match when the model lightly rewords it.
fn is_generic_meta_options(options: &[String]) -> bool {
    if options.len() != 4 {
        return false;
    }

    let normalized: Vec<String> = options.iter().map(|o| normalize_option(o)).collect();
    let banned: Vec<String> = GENERIC_META_OPTIONS
        .iter()
        .map(|o| normalize_option(o))
        .collect();

    if banned.iter().all(|b| normalized.contains(b)) {
        return true;
    }

    let hits = normalized
        .iter()
        .filter(|o| {
            (o.contains("excerpt") || o.contains("fragment") || o.contains("passage"))
                && (o.contains("consistent")
                    || o.contains("contradict")
                    || o.contains("unrelated")
                    || o.contains("not directly supported")
                    || o.contains("not supported"))
        })
        .count();

    hits >= 3
}

enum SemanticOutcome {
    Pass,
    Skip,
    Fail(FailureReason),
}

/// Independent checker: identify the correct-option set from the excerpts
/// alone, decoupled from the candidate's self-reported answer. Passes only
/// when exactly one option is correct and it matches the candidate.
/// Unparseable checker output (after relaxed and strict attempts) skips the
/// check instead of rejecting the candidate.
async fn semantic_check_mcq(
    provider: &dyn TextCompletionProvider,
    body: &str,
    draft: &McqDraft,
) -> SemanticOutcome {
    let mut letters: Option<Vec<String>> = None;

    for strict in [false, true] {
        let prompt = mcq_check_prompt(body, draft, strict);
        let Ok(response) = provider.generate(&prompt, Some(FormatHint::Json)).await else {
            return SemanticOutcome::Skip;
        };

        let parsed = parse_checker_letters(&response);
        if !parsed.is_empty() {
            letters = Some(parsed);
            break;
        }
    }

    let Some(letters) = letters else {
        return SemanticOutcome::Skip;
    };

    if letters.len() != 1 {
        return SemanticOutcome::Fail(FailureReason::SemanticAmbiguous(letters));
    }

    if letters[0] != draft.answer.as_str() {
        return SemanticOutcome::Fail(FailureReason::SemanticMismatch {
            expected: draft.answer.as_str().to_string(),
            got: letters[0].clone(),
        });
    }

    SemanticOutcome::Pass
}

/// Extract correct-option letters from checker output: the preferred
/// `{"correct": [...]}` shape, then `{"answer": "b"}` / `{"correct": "b"}`
/// strings, then bare letters in free text. Duplicates removed, order kept.
fn parse_checker_letters(response: &str) -> Vec<String> {
    if let Some(obj) = extract_json(response) {
        if let Some(arr) = obj.get("correct").and_then(|c| c.as_array()) {
            let mut letters = Vec::new();
            for item in arr {
                if let Some(letter) = item
                    .as_str()
                    .and_then(normalize_answer_letter)
                    .map(|l| l.as_str().to_string())
                {
                    if !letters.contains(&letter) {
                        letters.push(letter);
                    }
                }
            }
            return letters;
        }

        for key in ["answer", "correct"] {
            if let Some(letter) = obj
                .get(key)
                .and_then(|v| v.as_str())
                .and_then(normalize_answer_letter)
            {
                return vec![letter.as_str().to_string()];
            }
        }
    }

    let lowered = response.to_lowercase();
    let mut letters = Vec::new();
    for cap in TEXT_LETTER_RX.captures_iter(&lowered) {
        let letter = cap[1].to_string();
        if !letters.contains(&letter) {
            letters.push(letter);
        }
    }
    letters
}

fn mcq_fallback(
    ctx: &FlattenedContext,
    meta: QuestionMeta,
    last_reason: FailureReason,
) -> GeneratedQuestion {
    let seed = fallback_seed(ctx);
    let claim = truncate_chars(&squash_whitespace(&seed.claim), SNIPPET_MAX_CHARS);

    let mut options: Vec<String> = vec![claim.clone()];
    for distractor in FALLBACK_DISTRACTORS {
        options.push(distractor.to_string());
    }

    // Claims can collide with a distractor; keep the set unique and padded.
    let mut unique: Vec<String> = Vec::with_capacity(4);
    for option in options {
        let key = normalize_option(&option);
        if !key.is_empty() && !unique.iter().any(|u| normalize_option(u) == key) {
            unique.push(option);
        }
        if unique.len() == 4 {
            break;
        }
    }
    while unique.len() < 4 {
        unique.push(format!(
            "The description refers to a different class of methods than the one presented ({}).",
            unique.len() + 1
        ));
    }

    let options: [String; 4] = unique.try_into().expect("padded to four above");

    assemble(
        Question::MultipleChoice {
            stem: "Which of the following statements matches the source material?".to_string(),
            options,
            answer: OptionLetter::A,
            explanation: Explanation {
                tag: seed.tag.clone(),
                rationale: "The correct answer follows directly from the cited passage."
                    .to_string(),
            },
        },
        meta,
        vec![Citation {
            source: seed.tag.source,
            page: seed.tag.page,
            quote: claim,
        }],
        Some(FallbackInfo {
            reason: last_reason.to_string(),
        }),
    )
}

// ============ Fallback seed selection ============

struct FallbackSeed {
    tag: CitationTag,
    claim: String,
    quote: String,
}

/// Pick the claim a fallback question asserts: the first context line that
/// is non-empty, not header-like, and over 40 characters; its leading tag
/// names the citation. With no usable line, the first citation's quote
/// stands in.
fn fallback_seed(ctx: &FlattenedContext) -> FallbackSeed {
    let best = ctx
        .body
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !looks_like_header(line) && line.chars().count() > 40)
        .unwrap_or_default();

    let mut tag = ctx
        .citations
        .first()
        .map(|c| CitationTag {
            source: c.source.clone(),
            page: c.page,
        })
        .unwrap_or_else(|| CitationTag {
            source: "source".to_string(),
            page: 1,
        });

    let mut quote = ctx
        .citations
        .first()
        .map(|c| c.quote.clone())
        .filter(|q| !q.trim().is_empty())
        .unwrap_or_else(|| "A passage from the material.".to_string());

    let mut claim = best.to_string();
    if let Some((parsed_tag, rest)) = parse_leading_tag(best) {
        tag = parsed_tag;
        quote = truncate_chars(&rest, SNIPPET_MAX_CHARS);
        claim = rest;
    }

    if claim.trim().is_empty() {
        claim = quote.clone();
    }

    FallbackSeed { tag, claim, quote }
}

// ============ Prompt builders ============

fn avoid_block(avoid_stems: &[String]) -> String {
    if avoid_stems.is_empty() {
        return String::new();
    }
    let mut block = String::from("\nDo NOT repeat any of these recent questions:\n");
    for stem in avoid_stems {
        block.push_str("- ");
        block.push_str(stem);
        block.push('\n');
    }
    block
}

fn yn_base_prompt(body: &str, difficulty: &str, variant: u32, avoid_stems: &[String]) -> String {
    format!(
        "Use ONLY the excerpts below and generate ONE yes/no question \
         (variant {variant}, difficulty {difficulty}).\n\
         Return ONLY JSON: {{\"stem\":str,\"answer\":\"YES\"|\"NO\",\"explanation\":str}}.\n\n\
         Hard requirements:\n\
         - \"answer\" is exactly \"YES\" or \"NO\",\n\
         - \"explanation\" MUST contain exactly one [file_name|p.N] tag from the excerpts,\n\
         - the tag MUST be followed by a short rationale (at least one sentence) for the YES/NO,\n\
         - the rationale must follow from the quoted excerpts, no guessing.\n\n\
         No comments, no markdown, no extra text.\n\
         {avoid}\n\
         Excerpts:\n{body}",
        variant = variant,
        difficulty = difficulty,
        avoid = avoid_block(avoid_stems),
        body = body,
    )
}

fn mcq_base_prompt(body: &str, difficulty: &str, variant: u32, avoid_stems: &[String]) -> String {
    format!(
        "Use ONLY the excerpts below and generate ONE multiple-choice question \
         (variant {variant}, difficulty {difficulty}).\n\n\
         Hard requirements:\n\
         - exactly 4 options, all UNIQUE,\n\
         - exactly 1 correct answer and 3 wrong but plausible ones,\n\
         - options are PLAIN text (no 'a)', 'b)', numbering, etc.),\n\
         - answer is a letter: \"a\"|\"b\"|\"c\"|\"d\",\n\
         - never use options like \"all of the above\",\n\
         - the stem covers one specific fact or concept from the excerpts (no broad questions),\n\
         - NEVER use meta-options like \"a statement consistent with / contradicting / \
           unrelated to the excerpts\" - every option must carry subject-matter content.\n\n\
         Return ONLY JSON:\n\
         {{\"stem\":str,\"options\":[str,str,str,str],\"answer\":\"a\"|\"b\"|\"c\"|\"d\",\"explanation\":str}}\n\n\
         Requirement: \"explanation\" MUST contain exactly one [file_name|p.N] tag \
         from the excerpts below.\n\
         No comments, no markdown, no extra text.\n\
         {avoid}\n\
         Excerpts:\n{body}",
        variant = variant,
        difficulty = difficulty,
        avoid = avoid_block(avoid_stems),
        body = body,
    )
}

fn yn_check_prompt(body: &str, stem: &str, strict: bool) -> String {
    let extra = if strict {
        "\nNO markdown, NO comments, NO rationale. Return a single line of JSON.\n\
         Example: {\"answer\":\"YES\"}\n"
    } else {
        ""
    };

    format!(
        "Use ONLY the excerpts below.\n\
         Decide which answer (YES/NO) is correct for this question.\n\
         If it does not clearly follow from the excerpts, answer \"NO\".\n\
         {extra}\n\
         Return ONLY JSON: {{\"answer\":\"YES\"|\"NO\"}}.\n\n\
         Yes/no question:\n{stem}\n\n\
         Excerpts:\n{body}",
        extra = extra,
        stem = stem,
        body = body,
    )
}

fn mcq_check_prompt(body: &str, draft: &McqDraft, strict: bool) -> String {
    let extra = if strict {
        "\nNO markdown, NO comments, NO rationale. Return a single line of JSON.\n\
         Example: {\"correct\":[\"b\"]}\n"
    } else {
        ""
    };

    let payload = serde_json::json!({
        "stem": draft.stem,
        "options": draft.options,
    });

    format!(
        "Use ONLY the excerpts below.\n\
         Identify which options are the CORRECT answer to the question (stem).\n\
         - If more than one option fits, return all that fit.\n\
         - If it cannot be decided unambiguously, return every option that might fit.\n\
         - If none follows from the excerpts, return [].\n\
         {extra}\n\
         Return ONLY JSON:\n\
         {{\"correct\":[\"a\"|\"b\"|\"c\"|\"d\", ...]}}\n\n\
         Question:\n{payload}\n\n\
         Excerpts:\n{body}",
        extra = extra,
        payload = payload,
        body = body,
    )
}

// ============ Assembly helpers ============

/// Split a validated explanation string (exactly one tag) into the typed
/// explanation value.
fn split_explanation(explanation: &str) -> Explanation {
    let tag = parse_tags(explanation)
        .into_iter()
        .next()
        .unwrap_or_else(|| CitationTag {
            source: "source".to_string(),
            page: 1,
        });
    Explanation {
        rationale: strip_tags(explanation),
        tag,
    }
}

fn assemble(
    question: Question,
    metadata: QuestionMeta,
    citations: Vec<Citation>,
    fallback: Option<FallbackInfo>,
) -> GeneratedQuestion {
    GeneratedQuestion {
        question,
        metadata,
        citations,
        fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Test provider that replays a fixed script of responses; `None`
    /// entries simulate a transport failure.
    struct Scripted {
        responses: Mutex<VecDeque<Option<String>>>,
    }

    impl Scripted {
        fn new(responses: Vec<Option<&str>>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
            }
        }

        fn failing() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl TextCompletionProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn generate(&self, _prompt: &str, _hint: Option<FormatHint>) -> Result<String> {
            match self.responses.lock().unwrap().pop_front() {
                Some(Some(text)) => Ok(text),
                _ => bail!("scripted provider exhausted"),
            }
        }
    }

    fn passages() -> Vec<Passage> {
        vec![
            Passage {
                chunk_id: 1,
                source_id: 1,
                source: "A.pdf".to_string(),
                page: 3,
                quote: "Dijkstra's algorithm requires non-negative edge weights to be correct."
                    .to_string(),
                text: "Dijkstra's algorithm requires non-negative edge weights to be correct."
                    .to_string(),
                score: 0.9,
            },
            Passage {
                chunk_id: 2,
                source_id: 1,
                source: "A.pdf".to_string(),
                page: 7,
                quote: "Bellman-Ford handles negative edge weights at a higher time cost."
                    .to_string(),
                text: "Bellman-Ford handles negative edge weights at a higher time cost."
                    .to_string(),
                score: 0.8,
            },
        ]
    }

    fn config() -> GenerationConfig {
        GenerationConfig::default()
    }

    const YN_OK: &str = r#"{"stem": "Does Dijkstra's algorithm require non-negative edge weights?", "answer": "YES", "explanation": "[A.pdf|p.3] The passage states the requirement explicitly."}"#;

    const MCQ_OK: &str = r#"{"stem": "Which condition must edge weights satisfy for Dijkstra's algorithm?", "options": ["a) They must be non-negative", "They must all be equal", "They must be integers", "They must form a tree"], "answer": "a", "explanation": "[A.pdf|p.3] Non-negative weights are required for correctness."}"#;

    #[tokio::test]
    async fn yn_happy_path() {
        // First response: candidate. Second: semantic checker agrees.
        let provider = Scripted::new(vec![Some(YN_OK), Some(r#"{"answer":"YES"}"#)]);
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::YesNo,
            Some("graphs"),
            Some("medium"),
            1,
            &[],
        )
        .await;

        assert!(!result.is_fallback());
        let Question::YesNo {
            answer,
            explanation,
            ..
        } = &result.question
        else {
            panic!("expected yes/no question");
        };
        assert_eq!(*answer, YnAnswer::Yes);
        assert_eq!(explanation.tag.source, "A.pdf");
        assert_eq!(explanation.tag.page, 3);
        assert!(explanation.rationale.chars().count() >= MIN_RATIONALE_CHARS);
        assert_eq!(result.citations.len(), 1);
        assert_eq!(result.metadata.topic, "graphs");
    }

    #[tokio::test]
    async fn yn_semantic_mismatch_overwrites_answer() {
        // Candidate says YES, checker says NO: the answer is overwritten,
        // not rejected, and the explanation is rewritten to match.
        let provider = Scripted::new(vec![Some(YN_OK), Some(r#"{"answer":"NO"}"#)]);
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::YesNo,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(!result.is_fallback());
        let Question::YesNo {
            answer,
            explanation,
            ..
        } = &result.question
        else {
            panic!("expected yes/no question");
        };
        assert_eq!(*answer, YnAnswer::No);
        assert!(explanation.rationale.contains("does not clearly support"));
        assert_eq!(explanation.tag.page, 3);
    }

    #[tokio::test]
    async fn yn_checker_unparseable_skips_semantic_check() {
        // Checker replies with unusable text twice (relaxed + strict):
        // the candidate is accepted as-is.
        let provider = Scripted::new(vec![Some(YN_OK), Some("???"), Some("???")]);
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::YesNo,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(!result.is_fallback());
        assert_eq!(result.question.answer_str(), "YES");
    }

    #[tokio::test]
    async fn yn_provider_failure_degrades_to_fallback() {
        let provider = Scripted::failing();
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::YesNo,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(result.is_fallback());
        let Question::YesNo {
            answer,
            explanation,
            stem,
        } = &result.question
        else {
            panic!("expected yes/no question");
        };
        assert_eq!(*answer, YnAnswer::Yes);
        assert_eq!(explanation.tag.source, "A.pdf");
        assert_eq!(explanation.tag.page, 3);
        assert!(stem.contains("Dijkstra"));
        assert!(result
            .fallback
            .as_ref()
            .unwrap()
            .reason
            .contains("no usable response"));
    }

    #[tokio::test]
    async fn yn_fallback_from_single_short_passage() {
        // A passage too short to seed a claim line falls back to the first
        // citation's quote, per the documented example.
        let provider = Scripted::failing();
        let short = vec![Passage {
            chunk_id: 1,
            source_id: 1,
            source: "A.pdf".to_string(),
            page: 3,
            quote: String::new(),
            text: "X is true.".to_string(),
            score: 0.5,
        }];
        let result = generate_question(
            &provider,
            &config(),
            &short,
            QuestionKind::YesNo,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(result.is_fallback());
        assert_eq!(result.question.answer_str(), "YES");
        assert_eq!(result.question.explanation().tag.render(), "[A.pdf|p.3]");
        assert_eq!(result.citations[0].source, "A.pdf");
        assert_eq!(result.citations[0].page, 3);
    }

    #[tokio::test]
    async fn yn_malformed_then_repaired() {
        // First attempt has a bad answer; the repair attempt succeeds.
        let bad = r#"{"stem": "Q?", "answer": "MAYBE", "explanation": "[A.pdf|p.3] A rationale long enough."}"#;
        let provider = Scripted::new(vec![
            Some(bad),
            Some(YN_OK),
            Some(r#"{"answer":"YES"}"#),
        ]);
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::YesNo,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(!result.is_fallback());
        assert_eq!(result.question.answer_str(), "YES");
    }

    #[tokio::test]
    async fn mcq_happy_path_normalizes_options() {
        let provider = Scripted::new(vec![Some(MCQ_OK), Some(r#"{"correct":["a"]}"#)]);
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::MultipleChoice,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(!result.is_fallback());
        let Question::MultipleChoice {
            options, answer, ..
        } = &result.question
        else {
            panic!("expected multiple-choice question");
        };
        // "a) " prefix stripped during normalization.
        assert_eq!(options[0], "They must be non-negative");
        assert_eq!(*answer, OptionLetter::A);
        let mut lowered: Vec<String> = options.iter().map(|o| o.to_lowercase()).collect();
        lowered.sort();
        lowered.dedup();
        assert_eq!(lowered.len(), 4);
    }

    #[tokio::test]
    async fn mcq_semantic_mismatch_triggers_repair() {
        // Checker picks "b" against the candidate's "a": reject and retry,
        // unlike the yes/no path which overwrites.
        let provider = Scripted::new(vec![
            Some(MCQ_OK),
            Some(r#"{"correct":["b"]}"#),
            Some(MCQ_OK),
            Some(r#"{"correct":["a"]}"#),
        ]);
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::MultipleChoice,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(!result.is_fallback());
        assert_eq!(result.question.answer_str(), "a");
    }

    #[tokio::test]
    async fn mcq_ambiguous_checker_rejects() {
        let provider = Scripted::new(vec![
            Some(MCQ_OK),
            Some(r#"{"correct":["a","b"]}"#),
            Some(MCQ_OK),
            Some(r#"{"correct":["a"]}"#),
        ]);
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::MultipleChoice,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(!result.is_fallback());
        assert_eq!(result.question.answer_str(), "a");
    }

    #[tokio::test]
    async fn mcq_checker_unparseable_skips() {
        let provider = Scripted::new(vec![Some(MCQ_OK), Some("???"), Some("???")]);
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::MultipleChoice,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(!result.is_fallback());
        assert_eq!(result.question.answer_str(), "a");
    }

    #[tokio::test]
    async fn mcq_meta_options_rejected() {
        let meta = r#"{"stem": "Which statement holds?", "options": ["A statement consistent with the excerpts", "A statement contradicting the excerpts", "A statement unrelated to the excerpts", "A statement not directly supported by the excerpts"], "answer": "a", "explanation": "[A.pdf|p.3] A rationale long enough."}"#;
        let provider = Scripted::new(vec![Some(meta), Some(MCQ_OK), Some(r#"{"correct":["a"]}"#)]);
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::MultipleChoice,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(!result.is_fallback());
        let Question::MultipleChoice { options, .. } = &result.question else {
            panic!("expected multiple-choice question");
        };
        assert!(!is_generic_meta_options(options.as_slice()));
    }

    #[tokio::test]
    async fn mcq_fallback_structure() {
        let provider = Scripted::failing();
        let result = generate_question(
            &provider,
            &config(),
            &passages(),
            QuestionKind::MultipleChoice,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(result.is_fallback());
        let Question::MultipleChoice {
            options, answer, ..
        } = &result.question
        else {
            panic!("expected multiple-choice question");
        };
        assert_eq!(*answer, OptionLetter::A);
        assert!(options[0].contains("Dijkstra"));
        assert!(!is_generic_meta_options(options.as_slice()));
        let mut lowered: Vec<String> = options.iter().map(|o| o.to_lowercase()).collect();
        lowered.sort();
        lowered.dedup();
        assert_eq!(lowered.len(), 4);
    }

    #[tokio::test]
    async fn empty_context_fallback_still_valid() {
        let provider = Scripted::failing();
        let result = generate_question(
            &provider,
            &config(),
            &[],
            QuestionKind::YesNo,
            None,
            None,
            1,
            &[],
        )
        .await;

        assert!(result.is_fallback());
        assert_eq!(result.question.answer_str(), "YES");
        assert_eq!(count_tags(&result.question.explanation().render()), 1);
    }

    #[test]
    fn meta_option_fuzzy_detection() {
        let reworded = [
            "This is a statement consistent with the quoted excerpts".to_string(),
            "This is a statement contradicting the quoted excerpts".to_string(),
            "This is a statement unrelated to the quoted excerpts".to_string(),
            "Graphs can be colored with four colors".to_string(),
        ];
        assert!(is_generic_meta_options(&reworded));

        let content = [
            "Edge weights must be non-negative".to_string(),
            "Edge weights must be integers".to_string(),
            "Edge weights must be equal".to_string(),
            "Edge weights must form a tree".to_string(),
        ];
        assert!(!is_generic_meta_options(&content));
    }

    #[test]
    fn answer_letter_normalization() {
        assert_eq!(normalize_answer_letter("b"), Some(OptionLetter::B));
        assert_eq!(normalize_answer_letter(" C) "), Some(OptionLetter::C));
        assert_eq!(normalize_answer_letter("d. because"), Some(OptionLetter::D));
        assert_eq!(normalize_answer_letter("e"), None);
        assert_eq!(normalize_answer_letter(""), None);
    }

    #[test]
    fn checker_letter_parsing() {
        assert_eq!(
            parse_checker_letters(r#"{"correct":["b","B","c"]}"#),
            vec!["b".to_string(), "c".to_string()]
        );
        assert_eq!(
            parse_checker_letters(r#"{"answer":"d"}"#),
            vec!["d".to_string()]
        );
        assert_eq!(
            parse_checker_letters("the right option is b"),
            vec!["b".to_string()]
        );
        assert!(parse_checker_letters("???").is_empty());
    }

    #[test]
    fn failure_reason_display_names_problem() {
        let reason = FailureReason::SemanticMismatch {
            expected: "a".to_string(),
            got: "c".to_string(),
        };
        let text = reason.to_string();
        assert!(text.contains("expected=a"));
        assert!(text.contains("got=c"));
    }
}
