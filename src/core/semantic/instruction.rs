use std::collections::BTreeMap;

const PARAM_MARKER: &str = ":param";
const RETURN_MARKERS: [&str; 2] = [":returns", ":return"];

/// Documentation of the return value taken from the instruction block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReturnDoc {
    pub name: Option<String>,
    pub doc: String,
}

/// Instructions extracted from a structured comment block.
///
/// The block is a freeform paragraph followed by optional `:param <name>: <doc>` lines and an
/// optional `:return: <doc>` (or `:return <name>: <doc>`) line. Lines that carry no marker are
/// appended to whichever section is open. Parsing never fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionModel {
    pub freeform: String,
    pub params: BTreeMap<String, String>,
    pub returns: Option<ReturnDoc>,
}

enum Section {
    Freeform,
    Param(String),
    Return,
}

impl InstructionModel {
    pub fn parse(block: &str) -> Self {
        let cleaned = clean_block(block);

        let mut freeform: Vec<&str> = Vec::new();
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        let mut returns: Option<ReturnDoc> = None;
        let mut section = Section::Freeform;

        for line in cleaned.lines() {
            let trimmed = line.trim_start();

            if let Some((name, doc)) = param_line(trimmed) {
                params.insert(name.clone(), doc.to_string());
                section = Section::Param(name);
                continue;
            }

            if let Some(doc) = return_line(trimmed) {
                returns = Some(doc);
                section = Section::Return;
                continue;
            }

            match &section {
                Section::Freeform => freeform.push(line),
                Section::Param(name) => {
                    if let Some(doc) = params.get_mut(name) {
                        doc.push('\n');
                        doc.push_str(line);
                    }
                }
                Section::Return => {
                    if let Some(ret) = returns.as_mut() {
                        ret.doc.push('\n');
                        ret.doc.push_str(line);
                    }
                }
            }
        }

        for doc in params.values_mut() {
            *doc = doc.trim().to_string();
        }
        if let Some(ret) = returns.as_mut() {
            ret.doc = ret.doc.trim().to_string();
        }

        Self {
            freeform: freeform.join("\n").trim().to_string(),
            params,
            returns,
        }
    }

    pub fn param_doc(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .filter(|d| !d.is_empty())
    }

    pub fn return_name(&self) -> Option<&str> {
        self.returns
            .as_ref()
            .and_then(|r| r.name.as_deref())
            .filter(|n| !n.is_empty())
    }

    pub fn return_doc(&self) -> Option<&str> {
        self.returns
            .as_ref()
            .map(|r| r.doc.as_str())
            .filter(|d| !d.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.freeform.is_empty() && self.params.is_empty() && self.returns.is_none()
    }
}

/// `:param name: doc` (a leading type token, as in `:param str name:`, is skipped).
fn param_line(line: &str) -> Option<(String, &str)> {
    let rest = line.strip_prefix(PARAM_MARKER)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let (head, doc) = match rest.split_once(':') {
        Some((head, doc)) => (head, doc.trim_start()),
        None => (rest, ""),
    };
    let name = head.split_whitespace().last()?;
    Some((name.to_string(), doc))
}

fn return_line(line: &str) -> Option<ReturnDoc> {
    let rest = RETURN_MARKERS
        .iter()
        .find_map(|marker| line.strip_prefix(marker))?;

    if let Some(doc) = rest.strip_prefix(':') {
        return Some(ReturnDoc {
            name: None,
            doc: doc.trim_start().to_string(),
        });
    }
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    match rest.split_once(':') {
        Some((name, doc)) => Some(ReturnDoc {
            name: Some(name.trim().to_string()).filter(|n| !n.is_empty()),
            doc: doc.trim_start().to_string(),
        }),
        None => Some(ReturnDoc {
            name: None,
            doc: rest.trim().to_string(),
        }),
    }
}

/// Strip the first line, remove the indentation shared by the remaining lines and drop leading
/// and trailing blank lines.
fn clean_block(block: &str) -> String {
    let mut lines = block.lines();
    let first = lines.next().map(str::trim).unwrap_or_default();
    let rest: Vec<&str> = lines.collect();

    let margin = rest
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut cleaned: Vec<&str> = Vec::with_capacity(rest.len() + 1);
    cleaned.push(first);
    for line in rest {
        cleaned.push(if line.trim().is_empty() {
            ""
        } else {
            line.get(margin..).unwrap_or_else(|| line.trim_start())
        });
    }

    while cleaned.first().is_some_and(|l| l.is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().is_some_and(|l| l.is_empty()) {
        cleaned.pop();
    }
    cleaned.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_block() {
        let block = "This is the documentation\nwith multiple lines\n:param param1: This is the first parameter\n    with additional description\n:param param2: This is the second parameter\n    with more details\n:return: This is the return value\n    with multiple lines";
        let model = InstructionModel::parse(block);

        assert_eq!(model.freeform, "This is the documentation\nwith multiple lines");
        assert_eq!(
            model.param_doc("param1"),
            Some("This is the first parameter\n    with additional description")
        );
        assert_eq!(
            model.param_doc("param2"),
            Some("This is the second parameter\n    with more details")
        );
        assert_eq!(model.return_name(), None);
        assert_eq!(
            model.return_doc(),
            Some("This is the return value\n    with multiple lines")
        );
    }

    #[test]
    fn test_indented_block_is_dedented() {
        let block = r#"
            Extract the phone numbers from the text
            :param text: the text to scan
            :return phone_numbers: every number found
        "#;
        let model = InstructionModel::parse(block);
        assert_eq!(model.freeform, "Extract the phone numbers from the text");
        assert_eq!(model.param_doc("text"), Some("the text to scan"));
        assert_eq!(model.return_name(), Some("phone_numbers"));
        assert_eq!(model.return_doc(), Some("every number found"));
    }

    #[test]
    fn test_no_markers_is_all_freeform() {
        let model = InstructionModel::parse("Say hello\nto everyone: loudly");
        assert_eq!(model.freeform, "Say hello\nto everyone: loudly");
        assert!(model.params.is_empty());
        assert!(model.returns.is_none());
    }

    #[test]
    fn test_total_on_odd_input() {
        for input in ["", "   ", "\n\n", ":param", ":param :", ":return", ":returns:", ":parameters x", "\u{00e9}t\u{00e9}\n  :param x"] {
            let _ = InstructionModel::parse(input);
        }
        assert!(InstructionModel::parse("").is_empty());
        assert_eq!(InstructionModel::parse(":parameters x").freeform, ":parameters x");
    }

    #[test]
    fn test_typed_param_marker() {
        let model = InstructionModel::parse("Doc\n:param str title: the title");
        assert_eq!(model.param_doc("title"), Some("the title"));
    }
}
