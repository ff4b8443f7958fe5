//! Template tokenizer and renderer
//!
//! A template is parsed once into fragments, then rendered any number of
//! times. Parsing never fails: malformed spans (an unterminated `${`) are
//! kept as literals, and `$${` passes through verbatim so templates can
//! embed literal `${` sequences the same way the scheduler's own escape
//! rule does.

use super::context::SubstitutionMap;
use super::error::TemplateError;

/// One token of a parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Verbatim text
    Literal(String),
    /// `${NAME}` with an all-uppercase name, substituted by PAPI
    UserVar(String),
    /// Any other `${...}` span, left for the scheduler (inner text stored)
    RuntimeVar(String),
}

/// A parsed job template
///
/// Rendering is a pure function of the template and the substitution map,
/// so rendering twice with the same inputs yields byte-identical output.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    fragments: Vec<Fragment>,
}

impl JobTemplate {
    /// Tokenize a template string
    pub fn parse(text: &str) -> Self {
        let mut fragments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(pos) = rest.find("${") {
            // `$${` is the scheduler's escape for a literal `${`; keep the
            // whole sequence verbatim and do not open a placeholder.
            if pos > 0 && rest.as_bytes()[pos - 1] == b'$' {
                literal.push_str(&rest[..pos + 2]);
                rest = &rest[pos + 2..];
                continue;
            }

            literal.push_str(&rest[..pos]);
            let after = &rest[pos + 2..];
            match after.find('}') {
                Some(end) => {
                    if !literal.is_empty() {
                        fragments.push(Fragment::Literal(std::mem::take(&mut literal)));
                    }
                    let inner = &after[..end];
                    if is_user_var(inner) {
                        fragments.push(Fragment::UserVar(inner.to_string()));
                    } else {
                        fragments.push(Fragment::RuntimeVar(inner.to_string()));
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated span, keep as literal
                    literal.push_str(&rest[pos..]);
                    rest = "";
                }
            }
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            fragments.push(Fragment::Literal(literal));
        }

        Self { fragments }
    }

    /// Names of all user placeholders in the template, deduplicated
    pub fn user_vars(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::UserVar(name) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Access the parsed fragments
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Substitute user placeholders, leaving runtime placeholders untouched
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::MissingPlaceholder` if any user placeholder
    /// has no entry in the map. Unused map entries are not an error.
    pub fn render(&self, vars: &SubstitutionMap) -> Result<String, TemplateError> {
        let mut out = String::new();
        // True when the previous chunk was a substituted value ending in
        // '$': a following literal '{' would otherwise open a placeholder.
        let mut dangling_dollar = false;

        for fragment in &self.fragments {
            match fragment {
                Fragment::Literal(text) => {
                    if dangling_dollar && text.starts_with('{') {
                        out.push('$');
                    }
                    dangling_dollar = false;
                    out.push_str(text);
                }
                Fragment::RuntimeVar(inner) => {
                    dangling_dollar = false;
                    out.push_str("${");
                    out.push_str(inner);
                    out.push('}');
                }
                Fragment::UserVar(name) => {
                    let value = vars
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingPlaceholder(name.clone()))?;
                    let escaped = escape_value(value);
                    dangling_dollar = escaped.ends_with('$');
                    out.push_str(&escaped);
                }
            }
        }

        Ok(out)
    }
}

/// User placeholders are `[A-Z][A-Z0-9_]*`; everything else is runtime
fn is_user_var(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Escape a user-supplied value so it cannot open a placeholder.
///
/// `${` becomes `$${`, which the scheduler renders back as the literal
/// two characters the user typed.
fn escape_value(value: &str) -> String {
    value.replace("${", "$${")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> SubstitutionMap {
        let mut map = SubstitutionMap::new();
        for (k, v) in pairs {
            map.set(*k, v);
        }
        map
    }

    #[test]
    fn test_literal_only() {
        let tpl = JobTemplate::parse("job \"plain\" { }");
        assert_eq!(tpl.user_vars(), Vec::<&str>::new());
        assert_eq!(
            tpl.render(&SubstitutionMap::new()).unwrap(),
            "job \"plain\" { }"
        );
    }

    #[test]
    fn test_user_var_substitution() {
        let tpl = JobTemplate::parse("id = \"${JOB_UUID}\"");
        let out = tpl.render(&vars(&[("JOB_UUID", "abc-123")])).unwrap();
        assert_eq!(out, "id = \"abc-123\"");
    }

    #[test]
    fn test_runtime_var_left_untouched() {
        let tpl = JobTemplate::parse("domain = \"${meta.domain}\"");
        let out = tpl.render(&SubstitutionMap::new()).unwrap();
        assert_eq!(out, "domain = \"${meta.domain}\"");
    }

    #[test]
    fn test_mixed_phases() {
        let tpl = JobTemplate::parse("Host(`${HOSTNAME}.${meta.domain}-${BASE_DOMAIN}`)");
        let out = tpl
            .render(&vars(&[("HOSTNAME", "deadbeef"), ("BASE_DOMAIN", "deploy.example")]))
            .unwrap();
        assert_eq!(out, "Host(`deadbeef.${meta.domain}-deploy.example`)");
    }

    #[test]
    fn test_missing_placeholder_is_an_error() {
        let tpl = JobTemplate::parse("owner = \"${OWNER}\"");
        let err = tpl.render(&SubstitutionMap::new()).unwrap_err();
        assert_eq!(err, TemplateError::MissingPlaceholder("OWNER".to_string()));
    }

    #[test]
    fn test_unused_map_entries_are_fine() {
        let tpl = JobTemplate::parse("x = 1");
        let out = tpl.render(&vars(&[("UNUSED", "v")])).unwrap();
        assert_eq!(out, "x = 1");
    }

    /// A user value containing `${...}` must land as inert text, never as a
    /// placeholder the scheduler would expand.
    #[test]
    fn test_user_value_cannot_inject_placeholder() {
        let tpl = JobTemplate::parse("title = \"${TITLE}\"");
        let out = tpl.render(&vars(&[("TITLE", "${OWNER_EMAIL}")])).unwrap();
        assert_eq!(out, "title = \"$${OWNER_EMAIL}\"");
        // Re-parsing the output finds no user placeholder
        let reparsed = JobTemplate::parse(&out);
        assert_eq!(reparsed.user_vars(), Vec::<&str>::new());
    }

    #[test]
    fn test_user_value_trailing_dollar_before_brace() {
        // "abc$" followed by a literal "{...}" must not form "${..."
        let tpl = JobTemplate::parse("${TITLE}{literal}");
        let out = tpl.render(&vars(&[("TITLE", "abc$")])).unwrap();
        assert_eq!(out, "abc$${literal}");
        let reparsed = JobTemplate::parse(&out);
        assert!(reparsed
            .fragments()
            .iter()
            .all(|f| matches!(f, Fragment::Literal(_))));
    }

    #[test]
    fn test_template_escape_passthrough() {
        // $${FOO} in the template itself stays verbatim for the scheduler
        let tpl = JobTemplate::parse("echo $${FOO} ${NAME}");
        let out = tpl.render(&vars(&[("NAME", "bar")])).unwrap();
        assert_eq!(out, "echo $${FOO} bar");
    }

    #[test]
    fn test_unterminated_span_is_literal() {
        let tpl = JobTemplate::parse("broken ${OOPS");
        let out = tpl.render(&SubstitutionMap::new()).unwrap();
        assert_eq!(out, "broken ${OOPS");
    }

    #[test]
    fn test_user_var_classification() {
        assert!(is_user_var("JOB_UUID"));
        assert!(is_user_var("GPU_NUM"));
        assert!(is_user_var("X"));
        assert!(!is_user_var("meta.domain"));
        assert!(!is_user_var("attr.unique.hostname"));
        assert!(!is_user_var("NOMAD_ALLOC_ID ")); // trailing space
        assert!(!is_user_var("lower"));
        assert!(!is_user_var("1BAD"));
        assert!(!is_user_var(""));
        assert!(!is_user_var("env.FOO"));
    }

    #[test]
    fn test_user_vars_deduplicated_and_sorted() {
        let tpl = JobTemplate::parse("${B} ${A} ${B} ${meta.x}");
        assert_eq!(tpl.user_vars(), vec!["A", "B"]);
    }

    /// Rendering twice with the same inputs yields byte-identical output
    #[test]
    fn test_render_is_idempotent() {
        let tpl = JobTemplate::parse("id=${JOB_UUID} d=${meta.domain} t=${TITLE}");
        let map = vars(&[("JOB_UUID", "u1"), ("TITLE", "${sneaky}")]);
        let first = tpl.render(&map).unwrap();
        let second = tpl.render(&map).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_adjacent_placeholders() {
        let tpl = JobTemplate::parse("${A}${B}");
        let out = tpl.render(&vars(&[("A", "1"), ("B", "2")])).unwrap();
        assert_eq!(out, "12");
    }

    #[test]
    fn test_multiline_template() {
        let text = "job \"module-${JOB_UUID}\" {\n  namespace = \"${NAMESPACE}\"\n  meta {\n    owner = \"${OWNER}\"\n  }\n}\n";
        let tpl = JobTemplate::parse(text);
        assert_eq!(tpl.user_vars(), vec!["JOB_UUID", "NAMESPACE", "OWNER"]);
        let out = tpl
            .render(&vars(&[
                ("JOB_UUID", "u"),
                ("NAMESPACE", "ai4eosc"),
                ("OWNER", "alice@x"),
            ]))
            .unwrap();
        assert!(out.contains("job \"module-u\""));
        assert!(out.contains("owner = \"alice@x\""));
    }
}
