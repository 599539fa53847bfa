//! Version-info templates: `key/value/` fields whose values may reference
//! capture groups of the rule that matched.

use log::debug;
use regex::bytes::Captures;
use std::collections::BTreeMap;

/// One `key<d>value<d>` field, unexpanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Field {
    pub key: String,
    pub value: String,
}

/// Split the field list that follows a pattern. `Err` carries the key of the
/// first field whose value never closes.
pub(crate) fn parse_fields(text: &str) -> Result<Vec<Field>, String> {
    let mut fields = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Ok(fields);
        }
        let (key, after_key) = match rest.strip_prefix("cpe:") {
            Some(r) => ("cpe".to_string(), r),
            None => {
                let end = rest.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(rest.len());
                (rest[..end].to_string(), &rest[end..])
            }
        };
        let mut chars = after_key.chars();
        let delim = match chars.next() {
            Some(d) if !key.is_empty() && !d.is_whitespace() => d,
            _ => return Err(key),
        };
        let body = chars.as_str();
        let close = body.find(delim).ok_or_else(|| key.clone())?;
        let value = body[..close].to_string();
        rest = &body[close + delim.len_utf8()..];
        if key == "cpe" {
            // `a` marks an application CPE; it carries nothing we keep.
            if let Some(r) = rest.strip_prefix('a') {
                if r.is_empty() || r.starts_with(char::is_whitespace) {
                    rest = r;
                }
            }
        }
        fields.push(Field { key, value });
    }
}

/// Replace `$N` with group N and expand the helper calls probe files use:
/// `$P(N)` keeps the printable bytes of group N, `$SUBST(N,"a","b")` replaces
/// `a` with `b` in group N, `$I(N,">")` reads group N as a big-endian (`>`) or
/// little-endian (`<`) unsigned integer. Groups that did not participate
/// expand to nothing. `None` when a helper is unknown or malformed.
pub(crate) fn expand(value: &str, caps: &Captures<'_>) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let digits = tail.find(|c: char| !c.is_ascii_digit()).unwrap_or(tail.len());
        if digits > 0 {
            out.push_str(&String::from_utf8_lossy(&group(caps, &tail[..digits])));
            rest = &tail[digits..];
            continue;
        }
        let name = tail.find(|c: char| !c.is_ascii_uppercase()).unwrap_or(tail.len());
        if name > 0 && tail[name..].starts_with('(') {
            let (args, after) = call_args(&tail[name + 1..])?;
            out.push_str(&helper(&tail[..name], &args, caps)?);
            rest = after;
            continue;
        }
        out.push('$');
        rest = tail;
    }
    out.push_str(rest);
    Some(out)
}

fn group(caps: &Captures<'_>, n: &str) -> Vec<u8> {
    n.parse::<usize>()
        .ok()
        .and_then(|i| caps.get(i))
        .map(|m| m.as_bytes().to_vec())
        .unwrap_or_default()
}

/// Arguments up to the closing parenthesis, quotes removed, and the text after it.
fn call_args(text: &str) -> Option<(Vec<String>, &str)> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for (i, c) in text.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => args.push(std::mem::take(&mut current)),
            ')' if !quoted => {
                args.push(current);
                return Some((args, &text[i + 1..]));
            }
            c if c.is_whitespace() && !quoted => {}
            c => current.push(c),
        }
    }
    None
}

fn helper(name: &str, args: &[String], caps: &Captures<'_>) -> Option<String> {
    let bytes = group(caps, args.first()?);
    match (name, args) {
        ("P", [_]) => {
            let printable: Vec<u8> = bytes.into_iter().filter(|b| b.is_ascii_graphic() || *b == b' ').collect();
            Some(String::from_utf8_lossy(&printable).into_owned())
        }
        ("SUBST", [_, from, to]) if !from.is_empty() => {
            Some(String::from_utf8_lossy(&bytes).replace(from.as_str(), to))
        }
        ("I", [_, order]) if bytes.len() <= 8 => {
            let fold = |n: u64, b: &u8| (n << 8) | u64::from(*b);
            let n = match order.as_str() {
                ">" => bytes.iter().fold(0, fold),
                "<" => bytes.iter().rev().fold(0, fold),
                _ => return None,
            };
            Some(n.to_string())
        }
        _ => None,
    }
}

/// Fields of a matched template after group substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    fields: BTreeMap<String, String>,
    /// Every `cpe:` field as a full `cpe:/...` name, in template order.
    pub cpe: Vec<String>,
}

impl VersionInfo {
    pub(crate) fn from_fields(fields: &[Field], caps: &Captures<'_>) -> Self {
        let mut info = VersionInfo::default();
        for f in fields {
            let Some(value) = expand(&f.value, caps) else {
                debug!("dropping field `{}`: cannot expand {:?}", f.key, f.value);
                continue;
            };
            let value = value.trim().to_string();
            if f.key == "cpe" {
                info.cpe.push(format!("cpe:/{}", value));
            } else {
                info.fields.insert(f.key.clone(), value);
            }
        }
        info
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn product(&self) -> Option<&str> {
        self.get("p")
    }

    pub fn version(&self) -> Option<&str> {
        self.get("v")
    }

    pub fn info(&self) -> Option<&str> {
        self.get("i")
    }

    pub fn hostname(&self) -> Option<&str> {
        self.get("h")
    }

    pub fn os(&self) -> Option<&str> {
        self.get("o")
    }

    pub fn device_type(&self) -> Option<&str> {
        self.get("d")
    }

    /// Product and version joined by a space; empty when neither is known.
    pub fn version_string(&self) -> String {
        [self.product(), self.version()].into_iter().flatten().collect::<Vec<_>>().join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::bytes::Regex;

    fn keys(fields: &[Field]) -> Vec<(&str, &str)> {
        fields.iter().map(|f| (f.key.as_str(), f.value.as_str())).collect()
    }

    #[test]
    fn fields_with_and_without_separating_spaces() {
        let tight = parse_fields("p/OpenSSH/v/$2/").unwrap();
        assert_eq!(keys(&tight), vec![("p", "OpenSSH"), ("v", "$2")]);

        let spaced = parse_fields(" p|Apache httpd| v/$1/ i/Ubuntu/ cpe:/a:apache:http_server:$1/a o/Linux/").unwrap();
        assert_eq!(
            keys(&spaced),
            vec![
                ("p", "Apache httpd"),
                ("v", "$1"),
                ("i", "Ubuntu"),
                ("cpe", "a:apache:http_server:$1"),
                ("o", "Linux"),
            ]
        );
    }

    #[test]
    fn cpe_fields_accumulate_as_full_names() {
        let re = Regex::new(r"^SSH-([\d.]+)").unwrap();
        let caps = re.captures(b"SSH-2.0").unwrap();
        let fields = parse_fields("cpe:/a:openbsd:openssh/a cpe:|o:linux:linux_kernel:$1|").unwrap();
        let info = VersionInfo::from_fields(&fields, &caps);
        assert_eq!(info.cpe, vec!["cpe:/a:openbsd:openssh", "cpe:/o:linux:linux_kernel:2.0"]);
    }

    #[test]
    fn unterminated_field_names_its_key() {
        assert_eq!(parse_fields("p/OpenSSH/ v/8.9").unwrap_err(), "v");
    }

    #[test]
    fn expansion_substitutes_groups() {
        let re = Regex::new(r"^(\w+)-(\w+)(-x)?").unwrap();
        let caps = re.captures(b"abc-de\x01f").unwrap();
        assert_eq!(expand("$2 of $1", &caps).as_deref(), Some("de of abc"));
        assert_eq!(expand("[$3]", &caps).as_deref(), Some("[]"));
        assert_eq!(expand("$9", &caps).as_deref(), Some(""));
        assert_eq!(expand("cost $ 5", &caps).as_deref(), Some("cost $ 5"));

        let re = Regex::new(r"(?-u)^v=(.*)").unwrap();
        let caps = re.captures(b"v=1.\x002\x7f").unwrap();
        assert_eq!(expand("$P(1)", &caps).as_deref(), Some("1.2"));
    }

    #[test]
    fn subst_and_integer_helpers() {
        let re = Regex::new(r"(?-u)^OpenSSH_(\S+) (.{2})").unwrap();
        let caps = re.captures(b"OpenSSH_7_4p1 \x01\x02").unwrap();
        assert_eq!(expand(r#"$SUBST(1,"_",".")"#, &caps).as_deref(), Some("7.4p1"));
        assert_eq!(expand(r#"v$I(2,">")"#, &caps).as_deref(), Some("v258"));
        assert_eq!(expand(r#"$I(2,"<")"#, &caps).as_deref(), Some("513"));
        assert_eq!(expand(r#"$SUBST(1, "_", ", ")"#, &caps).as_deref(), Some("7, 4p1"));
    }

    #[test]
    fn unknown_or_broken_helpers_drop_the_field() {
        let re = Regex::new(r"^(\w+)").unwrap();
        let caps = re.captures(b"abc").unwrap();
        assert_eq!(expand("$UPPER(1)", &caps), None);
        assert_eq!(expand("$SUBST(1,\"a\"", &caps), None);
        assert_eq!(expand("$I(1,\"?\")", &caps), None);

        let fields = parse_fields(r#"p/Foo/ v/$SUBST(1,"_")/ i/$1/"#).unwrap();
        let info = VersionInfo::from_fields(&fields, &caps);
        assert_eq!(info.version(), None);
        assert_eq!(info.info(), Some("abc"));
        assert_eq!(info.version_string(), "Foo");
    }

    #[test]
    fn version_string_skips_missing_parts() {
        let re = Regex::new(r"^(x)").unwrap();
        let caps = re.captures(b"x").unwrap();
        let info = VersionInfo::from_fields(&parse_fields("v/$1/").unwrap(), &caps);
        assert_eq!(info.version_string(), "x");
        let info = VersionInfo::from_fields(&parse_fields("p/Foo/ v//").unwrap(), &caps);
        assert_eq!(info.version_string(), "Foo");
        assert_eq!(info.version(), None);
    }
}
