//! Signature Transform Engine.
//!
//! The platform protects media URLs two ways: an obfuscated signature
//! that must be permuted back into shape before the URL is valid, and a
//! throttling parameter (`n`) that, left undecoded, makes the CDN serve
//! bytes at a crawl. Both transforms are dictated by the platform's
//! client-side player script and change with every script version.
//!
//! Rather than interpreting the script, the extractor scans it for the
//! small family of character-array operations the transforms are built
//! from (reverse, swap-at-offset, drop-prefix) and compiles the call
//! sequence into a data-driven instruction list, [`CipherProgram`].
//! Applying a program is then a pure, deterministic replay.
//!
//! Extraction parses a third-party script and is by far the expensive
//! step, so programs are cached per script version: many tracks share
//! one program, and extraction for a given version happens once per
//! process under normal operation.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use regex_lite::Regex;
use url::Url;

use crate::platform::Platform;

/// A single character-array operation of a transform routine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SigOp {
    /// Reverse the array.
    Reverse,
    /// Swap the first element with the one at `offset % len`.
    Swap(usize),
    /// Drop the first `n` elements.
    Splice(usize),
}

/// Errors from fetching or parsing the player script.
///
/// Fatal for the current resolution attempt and always propagated: a
/// wrong signature produces a URL that serves HTTP 403 rather than
/// audio, which is strictly worse than failing loudly here. A failed
/// extraction never poisons the program cache for other versions.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("player script fetch failed: {0}")]
    Fetch(String),

    #[error("no recognizable transform pattern: {0}")]
    Pattern(String),
}

/// Extracted transformation rules of one player script version.
///
/// Keyed by the script version token, not by track id; many tracks share
/// one program. Immutable once extracted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherProgram {
    id: String,
    sig_ops: Vec<SigOp>,
    nsig_ops: Vec<SigOp>,
}

impl CipherProgram {
    /// Query parameter carrying the throttling token.
    const THROTTLING_PARAM: &'static str = "n";

    #[must_use]
    pub fn new(id: impl Into<String>, sig_ops: Vec<SigOp>, nsig_ops: Vec<SigOp>) -> Self {
        Self {
            id: id.into(),
            sig_ops,
            nsig_ops,
        }
    }

    /// Script version token this program was extracted from.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replays the signature operation sequence over the obfuscated
    /// signature. Pure: same program and input always produce the same
    /// output.
    #[must_use]
    pub fn apply_signature(&self, obfuscated: &str) -> String {
        Self::run(&self.sig_ops, obfuscated)
    }

    /// Decodes the throttling parameter embedded in the URL query, if
    /// present, and returns the corrected URL. A URL without the
    /// parameter is returned unchanged.
    #[must_use]
    pub fn apply_throttling(&self, url: &Url) -> Url {
        let Some(throttled) = url
            .query_pairs()
            .find(|(key, _)| key == Self::THROTTLING_PARAM)
            .map(|(_, value)| value.into_owned())
        else {
            return url.clone();
        };

        let decoded = Self::run(&self.nsig_ops, &throttled);

        let others: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != Self::THROTTLING_PARAM)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut corrected = url.clone();
        corrected
            .query_pairs_mut()
            .clear()
            .extend_pairs(others)
            .append_pair(Self::THROTTLING_PARAM, &decoded);
        corrected
    }

    fn run(ops: &[SigOp], input: &str) -> String {
        let mut chars: Vec<char> = input.chars().collect();
        for op in ops {
            match *op {
                SigOp::Reverse => chars.reverse(),
                SigOp::Swap(offset) => {
                    if !chars.is_empty() {
                        let offset = offset % chars.len();
                        chars.swap(0, offset);
                    }
                }
                SigOp::Splice(count) => {
                    chars.drain(..count.min(chars.len()));
                }
            }
        }
        chars.into_iter().collect()
    }
}

/// One `OBJ.member(a,N)` call inside a transform routine.
struct HelperCall {
    object: String,
    member: String,
    argument: usize,
}

/// A transform routine found in the script: its name and call sequence.
struct TransformFn {
    name: String,
    calls: Vec<HelperCall>,
}

/// Extracts the signature and throttling transforms from a player
/// script.
///
/// The script is expected to contain one or two routines of the shape
/// `name=function(a){a=a.split("");OBJ.x(a,1);..;return a.join("")}`
/// over a helper object whose members perform the three known
/// operations. The signature routine is recognized by its call site on
/// the descriptor's `s` value, the throttling routine by its call site
/// on the `n` query value; when the call sites cannot be found the
/// routines are taken positionally.
pub fn extract_program(program_ref: &str, script: &str) -> Result<CipherProgram, ExtractionError> {
    let transforms = find_transforms(script)?;
    if transforms.is_empty() {
        return Err(ExtractionError::Pattern(
            "no split/join transform routine found".to_string(),
        ));
    }

    let sig_name = find_callee(script, r"([A-Za-z0-9_$]+)\(decodeURIComponent\(").or_else(|| {
        // Unreferenced scripts: the signature routine comes first.
        Some(transforms[0].name.clone())
    });
    let nsig_name = find_callee(script, r#""n",\s*([A-Za-z0-9_$]+)\("#);

    let sig_ops = transforms
        .iter()
        .find(|t| Some(&t.name) == sig_name.as_ref())
        .map(|t| compile_calls(script, &t.calls))
        .transpose()?
        .ok_or_else(|| ExtractionError::Pattern("signature routine not found".to_string()))?;

    // Scripts predating URL throttling carry no second routine; the
    // program then leaves throttling parameters untouched.
    let nsig_ops = match nsig_name {
        Some(name) => transforms
            .iter()
            .find(|t| t.name == name)
            .map(|t| compile_calls(script, &t.calls))
            .transpose()?
            .unwrap_or_default(),
        None => transforms
            .get(1)
            .map(|t| compile_calls(script, &t.calls))
            .transpose()?
            .unwrap_or_default(),
    };

    debug!(
        "extracted program {program_ref}: {} signature ops, {} throttling ops",
        sig_ops.len(),
        nsig_ops.len()
    );

    Ok(CipherProgram::new(program_ref, sig_ops, nsig_ops))
}

/// Finds all split/join transform routines in the script.
fn find_transforms(script: &str) -> Result<Vec<TransformFn>, ExtractionError> {
    let routine = Regex::new(
        r#"([A-Za-z0-9_$]+)\s*=\s*function\(a\)\{a=a\.split\(""\);(.*?)return a\.join\(""\)\}"#,
    )
    .expect("routine pattern is valid");
    let call = Regex::new(r"([A-Za-z0-9_$]+)\.([A-Za-z0-9_$]+)\(a,(\d+)\)")
        .expect("call pattern is valid");

    let mut transforms = Vec::new();
    for captures in routine.captures_iter(script) {
        let name = captures[1].to_string();
        let body = &captures[2];

        let calls: Vec<HelperCall> = call
            .captures_iter(body)
            .map(|c| {
                let argument = c[3]
                    .parse::<usize>()
                    .map_err(|e| ExtractionError::Pattern(format!("bad call argument: {e}")))?;
                Ok(HelperCall {
                    object: c[1].to_string(),
                    member: c[2].to_string(),
                    argument,
                })
            })
            .collect::<Result<_, ExtractionError>>()?;

        if !calls.is_empty() {
            transforms.push(TransformFn { name, calls });
        }
    }

    Ok(transforms)
}

/// Finds the name of the routine invoked at a known call-site pattern;
/// the pattern's first capture group is the routine name.
fn find_callee(script: &str, site: &str) -> Option<String> {
    let pattern = Regex::new(site).ok()?;
    pattern
        .captures(script)
        .map(|captures| captures[1].to_string())
}

/// Resolves each helper call against the helper object definition and
/// classifies the member bodies into operations.
fn compile_calls(script: &str, calls: &[HelperCall]) -> Result<Vec<SigOp>, ExtractionError> {
    let mut ops = Vec::with_capacity(calls.len());
    for call in calls {
        let body = member_body(script, &call.object, &call.member)?;

        let op = if body.contains("reverse") {
            SigOp::Reverse
        } else if body.contains("splice") {
            SigOp::Splice(call.argument)
        } else if body.contains("%a.length") || body.contains("% a.length") {
            SigOp::Swap(call.argument)
        } else {
            return Err(ExtractionError::Pattern(format!(
                "unclassifiable helper {}.{}",
                call.object, call.member
            )));
        };
        ops.push(op);
    }

    Ok(ops)
}

/// Locates the body of `object.member` inside the helper object literal.
fn member_body(script: &str, object: &str, member: &str) -> Result<String, ExtractionError> {
    let pattern = Regex::new(&format!(
        r"{}\s*:\s*function\(a(?:,b)?\)\{{([^}}]*)\}}",
        escape_ident(member)
    ))
    .map_err(|e| ExtractionError::Pattern(format!("member pattern for {member}: {e}")))?;

    // Constrain the search to the helper object literal so an unrelated
    // member with the same name elsewhere in the script cannot match.
    let object_def = Regex::new(&format!(
        r"(?s)var {}=\{{(.*?)\}};",
        escape_ident(object)
    ))
    .map_err(|e| ExtractionError::Pattern(format!("object pattern for {object}: {e}")))?;

    let scope = object_def
        .captures(script)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| {
            ExtractionError::Pattern(format!("helper object {object} not found"))
        })?;

    pattern
        .captures(&scope)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| {
            ExtractionError::Pattern(format!("helper member {object}.{member} not found"))
        })
}

/// Escapes `$` for use inside a regex; script identifiers contain no
/// other metacharacters.
fn escape_ident(ident: &str) -> String {
    ident.replace('$', r"\$")
}

/// Capability seam for signature transformation.
///
/// The resolver only depends on this trait, so the whole resolution path
/// is decoupled from the script-parsing strategy; unit tests install a
/// fixed known program instead.
#[async_trait]
pub trait SignatureTransformer: Send + Sync {
    /// Returns the cipher program for a script version, extracting it on
    /// first use.
    async fn program(&self, program_ref: &str) -> Result<Arc<CipherProgram>, ExtractionError>;

    /// Drops the cached program for a script version, forcing the next
    /// request to re-extract. Used by the resolver's retry-once path
    /// when a cached program turns out stale.
    fn invalidate(&self, program_ref: &str);
}

/// Production transformer: fetches player scripts over the platform
/// boundary and caches extracted programs by script version.
pub struct ScriptTransformer {
    platform: Arc<dyn Platform>,
    programs: Mutex<HashMap<String, Arc<CipherProgram>>>,
}

impl ScriptTransformer {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            programs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SignatureTransformer for ScriptTransformer {
    async fn program(&self, program_ref: &str) -> Result<Arc<CipherProgram>, ExtractionError> {
        if let Some(program) = self
            .programs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(program_ref)
        {
            return Ok(Arc::clone(program));
        }

        // Two racing misses may both extract; the duplicate work is
        // bounded by one script parse and the second insert wins.
        let script = self
            .platform
            .player_script(program_ref)
            .await
            .map_err(|e| ExtractionError::Fetch(e.to_string()))?;
        let program = Arc::new(extract_program(program_ref, &script)?);

        self.programs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(program_ref.to_string(), Arc::clone(&program));

        Ok(program)
    }

    fn invalidate(&self, program_ref: &str) {
        self.programs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(program_ref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
var Wk={
j9:function(a){a.reverse()},
Qb:function(a,b){a.splice(0,b)},
z$:function(a,b){var c=a[0];a[0]=a[b%a.length];a[b%a.length]=c}
};
sx=function(a){a=a.split("");Wk.z$(a,3);Wk.j9(a,0);Wk.Qb(a,2);return a.join("")};
nx=function(a){a=a.split("");Wk.Qb(a,1);Wk.z$(a,4);return a.join("")};
c.set("sig",encodeURIComponent(sx(decodeURIComponent(c.s))));
d.get("n")&&d.set("n",nx(d.get("n")));
"#;

    #[test]
    fn extracts_both_routines() {
        let program = extract_program("v123", SCRIPT).unwrap();
        assert_eq!(program.id(), "v123");
        assert_eq!(
            program.sig_ops,
            vec![SigOp::Swap(3), SigOp::Reverse, SigOp::Splice(2)]
        );
        assert_eq!(program.nsig_ops, vec![SigOp::Splice(1), SigOp::Swap(4)]);
    }

    #[test]
    fn signature_transform_is_deterministic() {
        let program = extract_program("v123", SCRIPT).unwrap();
        let first = program.apply_signature("abcdefghij");
        let second = program.apply_signature("abcdefghij");
        assert_eq!(first, second);

        // Swap(3): dbcaefghij; Reverse: jihgfeacbd; Splice(2): hgfeacbd.
        assert_eq!(first, "hgfeacbd");
    }

    #[test]
    fn throttling_rewrites_n_parameter() {
        let program = extract_program("v123", SCRIPT).unwrap();
        let url = Url::parse("https://cdn.example.com/media?expire=1&n=abcdef").unwrap();

        let corrected = program.apply_throttling(&url);
        let n = corrected
            .query_pairs()
            .find(|(k, _)| k == "n")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        // Splice(1): bcdef; Swap(4): fcdeb.
        assert_eq!(n, "fcdeb");
        assert!(corrected.query_pairs().any(|(k, v)| k == "expire" && v == "1"));
    }

    #[test]
    fn throttling_leaves_url_without_n_untouched() {
        let program = extract_program("v123", SCRIPT).unwrap();
        let url = Url::parse("https://cdn.example.com/media?expire=1").unwrap();
        assert_eq!(program.apply_throttling(&url), url);
    }

    #[test]
    fn swap_and_splice_survive_degenerate_lengths() {
        let program = CipherProgram::new("t", vec![SigOp::Swap(7), SigOp::Splice(10)], vec![]);
        assert_eq!(program.apply_signature("ab"), "");
        assert_eq!(program.apply_signature(""), "");
    }

    #[test]
    fn unrecognizable_script_is_a_pattern_error() {
        let err = extract_program("v9", "var noise = 42;").unwrap_err();
        assert!(matches!(err, ExtractionError::Pattern(_)));
    }
}
