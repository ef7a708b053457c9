//! RFC 6570 URI template expansion (levels 1 to 3, with prefix modifiers)

use std::collections::HashMap;

/// Characters kept verbatim by `+` and `#` expansions
const RESERVED: &str = ":/?#[]@!$&'()*+,;=";

struct Operator {
    first: &'static str,
    separator: &'static str,
    named: bool,
    if_empty: &'static str,
    allow_reserved: bool,
}

impl Operator {
    fn from_prefix(c: char) -> Option<Self> {
        let op = match c {
            '+' => Operator::new("", ",", false, "", true),
            '#' => Operator::new("#", ",", false, "", true),
            '.' => Operator::new(".", ".", false, "", false),
            '/' => Operator::new("/", "/", false, "", false),
            ';' => Operator::new(";", ";", true, "", false),
            '?' => Operator::new("?", "&", true, "=", false),
            '&' => Operator::new("&", "&", true, "=", false),
            _ => return None,
        };
        Some(op)
    }

    const fn new(
        first: &'static str,
        separator: &'static str,
        named: bool,
        if_empty: &'static str,
        allow_reserved: bool,
    ) -> Self {
        Self {
            first,
            separator,
            named,
            if_empty,
            allow_reserved,
        }
    }

    fn simple() -> Self {
        Operator::new("", ",", false, "", false)
    }
}

/// Expand `template` with string variables. Undefined variables are omitted;
/// an unterminated expression is copied literally.
pub fn expand(template: &str, variables: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len() * 2);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                expand_expression(&after[..close], variables, &mut out);
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn expand_expression(expression: &str, variables: &HashMap<&str, String>, out: &mut String) {
    let mut chars = expression.chars();
    let (operator, specs) = match chars.next().and_then(Operator::from_prefix) {
        Some(op) => (op, chars.as_str()),
        None => (Operator::simple(), expression),
    };

    let mut first = true;
    for spec in specs.split(',') {
        let spec = spec.trim_end_matches('*');
        let (name, prefix) = match spec.split_once(':') {
            Some((name, len)) => (name, len.parse::<usize>().ok()),
            None => (spec, None),
        };
        let Some(value) = variables.get(name) else {
            continue;
        };

        out.push_str(if first { operator.first } else { operator.separator });
        first = false;

        let value: String = match prefix {
            Some(len) => value.chars().take(len).collect(),
            None => value.clone(),
        };

        if operator.named {
            out.push_str(name);
            if value.is_empty() {
                out.push_str(operator.if_empty);
                continue;
            }
            out.push('=');
        }
        out.push_str(&encode(&value, operator.allow_reserved));
    }
}

fn encode(value: &str, allow_reserved: bool) -> String {
    if !allow_reserved {
        return urlencoding::encode(value).into_owned();
    }
    let mut out = String::with_capacity(value.len());
    let mut buf = [0u8; 4];
    for c in value.chars() {
        if RESERVED.contains(c) || c == '%' {
            out.push(c);
        } else {
            out.push_str(&urlencoding::encode(c.encode_utf8(&mut buf)));
        }
    }
    out
}
