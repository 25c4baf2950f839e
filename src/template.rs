use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::SpiderError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:(?P<escaped>\$)|(?P<named>[_A-Za-z][_A-Za-z0-9]*)|\{(?P<braced>[_A-Za-z][_A-Za-z0-9]*)\}|(?P<invalid>))",
    )
    .unwrap()
});

/// Substitutes `$name` and `${name}` placeholders; `$$` yields a literal `$`.
///
/// Every placeholder must name a key of `values`. Unknown names and a `$`
/// that starts no valid placeholder are errors, reported with their line.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> Result<String, SpiderError> {
    let mut output = String::with_capacity(template.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        output.push_str(&template[last..whole.start()]);
        last = whole.end();

        if captures.name("escaped").is_some() {
            output.push('$');
            continue;
        }
        let name = captures
            .name("named")
            .or_else(|| captures.name("braced"))
            .map(|name| name.as_str());
        match name {
            Some(name) => {
                let value = values.get(name).ok_or_else(|| {
                    SpiderError::Template(format!(
                        "unknown placeholder '{name}' on line {}",
                        line_of(template, whole.start())
                    ))
                })?;
                output.push_str(value);
            }
            None => {
                return Err(SpiderError::Template(format!(
                    "invalid placeholder on line {}",
                    line_of(template, whole.start())
                )));
            }
        }
    }
    output.push_str(&template[last..]);
    Ok(output)
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_named_and_braced() {
        let rendered = render(
            "bet $t1 ${temp_dir}/brain -f $frac",
            &values(&[("t1", "/in/t1.nii"), ("temp_dir", "/job"), ("frac", "0.5")]),
        )
        .unwrap();
        assert_eq!(rendered, "bet /in/t1.nii /job/brain -f 0.5");
    }

    #[test]
    fn escaped_dollar() {
        let rendered = render("echo $$HOME ${x}y", &values(&[("x", "1")])).unwrap();
        assert_eq!(rendered, "echo $HOME 1y");
    }

    #[test]
    fn rejects_unknown_and_invalid() {
        let err = render("line one\necho $missing", &values(&[])).unwrap_err();
        assert_matches!(err, SpiderError::Template(ref message) if message.contains("line 2"));
        assert_matches!(
            render("awk '{print $1}'", &values(&[])),
            Err(SpiderError::Template(_))
        );
    }
}
