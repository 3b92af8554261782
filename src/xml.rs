//! Minimal namespace-aware XML tree used for OAI-PMH responses and
//! metadata filtering.
//!
//! OAI-PMH payloads are small, so responses are parsed into an owned
//! [`Element`] tree in one pass. Element names are kept both as written
//! (`qualified_name`, used for path descent the way the wire format spells
//! them) and resolved (`local_name` + `namespace`, used for XPath-style
//! selection).

use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::{ExtractorError, Result};

#[derive(Debug, Clone, Default)]
pub struct Element {
    qualified: String,
    local: String,
    prefix: Option<String>,
    namespace: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    /// Element name as written in the document, e.g. `oai:record`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Resolved namespace URI, if the element sits in one.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Concatenated, trimmed text content; `None` when there is none.
    pub fn text(&self) -> Option<&str> {
        if self.text.is_empty() {
            None
        } else {
            Some(&self.text)
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// First child whose qualified name matches.
    pub fn child(&self, qualified: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.qualified == qualified)
    }

    pub fn children_named<'a>(
        &'a self,
        qualified: &'a str,
    ) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.qualified == qualified)
    }

    pub fn child_text(&self, qualified: &str) -> Option<&str> {
        self.child(qualified).and_then(Element::text)
    }

    /// Descend by qualified element names. The first segment addresses this
    /// element itself; every further segment selects matching children of
    /// all elements reached so far.
    pub fn find_path<'a>(&'a self, path: &[&str]) -> Vec<&'a Element> {
        let Some((first, rest)) = path.split_first() else {
            return Vec::new();
        };
        if self.qualified != *first {
            return Vec::new();
        }
        let mut current = vec![self];
        for segment in rest {
            let mut next = Vec::new();
            for element in current {
                next.extend(element.children.iter().filter(|c| c.qualified == *segment));
            }
            current = next;
        }
        current
    }

    /// Evaluate a child-axis XPath subset against this element.
    ///
    /// Supported steps: `.` (context), `*`, `name`, `prefix:name`, each with
    /// an optional 1-based positional predicate (`step[n]`, applied per
    /// parent). Prefixes are resolved through `prefix_map`; the empty key
    /// holds the default namespace. An unknown prefix is an error
    /// regardless of whether anything would have matched.
    pub fn select<'a>(
        &'a self,
        path: &str,
        prefix_map: &HashMap<String, String>,
    ) -> Result<Vec<&'a Element>> {
        let mut current: Vec<&Element> = vec![self];
        for segment in path.split('/') {
            if segment == "." {
                continue;
            }
            if segment.is_empty() {
                return Err(ExtractorError::Filter(format!(
                    "unsupported empty step in xpath '{path}'"
                )));
            }
            let (name_part, index) = split_predicate(segment, path)?;
            let matcher = StepMatcher::resolve(name_part, prefix_map)?;
            let mut next = Vec::new();
            for context in current {
                let matched: Vec<&Element> = context
                    .children
                    .iter()
                    .filter(|child| matcher.matches(child))
                    .collect();
                match index {
                    Some(n) => {
                        if n >= 1 {
                            if let Some(element) = matched.get(n - 1) {
                                next.push(*element);
                            }
                        }
                    }
                    None => next.extend(matched),
                }
            }
            current = next;
        }
        Ok(current)
    }
}

enum StepMatcher<'a> {
    Any,
    Named {
        namespace: Option<&'a str>,
        local: &'a str,
    },
}

impl<'a> StepMatcher<'a> {
    fn resolve(name: &'a str, prefix_map: &'a HashMap<String, String>) -> Result<Self> {
        if name == "*" {
            return Ok(StepMatcher::Any);
        }
        if let Some((prefix, local)) = name.split_once(':') {
            let namespace = prefix_map.get(prefix).ok_or_else(|| {
                ExtractorError::Filter(format!("prefix '{prefix}' not found in prefix map"))
            })?;
            return Ok(StepMatcher::Named {
                namespace: Some(namespace.as_str()),
                local,
            });
        }
        Ok(StepMatcher::Named {
            namespace: prefix_map.get("").map(String::as_str),
            local: name,
        })
    }

    fn matches(&self, element: &Element) -> bool {
        match self {
            StepMatcher::Any => true,
            StepMatcher::Named { namespace, local } => {
                element.local == *local && element.namespace.as_deref() == *namespace
            }
        }
    }
}

fn split_predicate<'a>(segment: &'a str, path: &str) -> Result<(&'a str, Option<usize>)> {
    let Some(open) = segment.find('[') else {
        return Ok((segment, None));
    };
    let Some(inner) = segment[open..].strip_prefix('[').and_then(|s| s.strip_suffix(']'))
    else {
        return Err(ExtractorError::Filter(format!(
            "unsupported step '{segment}' in xpath '{path}'"
        )));
    };
    let index: usize = inner.parse().map_err(|_| {
        ExtractorError::Filter(format!(
            "unsupported predicate '{inner}' in xpath '{path}'"
        ))
    })?;
    Ok((&segment[..open], Some(index)))
}

/// Parse a document into its root element.
pub fn parse(source: &str) -> Result<Element> {
    Ok(parse_with_prefix_map(source)?.0)
}

/// Parse a document and additionally harvest every namespace declaration
/// into a prefix map (first declaration of a prefix wins, the default
/// namespace is keyed by the empty string).
pub fn parse_with_prefix_map(source: &str) -> Result<(Element, HashMap<String, String>)> {
    let mut reader = Reader::from_str(source);

    // in-progress elements, innermost last
    let mut stack: Vec<Element> = Vec::new();
    // namespace declarations per open element, resolved innermost-first
    let mut scopes: Vec<HashMap<String, String>> = Vec::new();
    let mut prefix_map: HashMap<String, String> = HashMap::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let element = open_element(&start, &mut scopes, &mut prefix_map)?;
                stack.push(element);
            }
            Event::Empty(start) => {
                let element = open_element(&start, &mut scopes, &mut prefix_map)?;
                scopes.pop();
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ExtractorError::Xml("unbalanced end tag".into()))?;
                scopes.pop();
                attach(&mut stack, &mut root, element);
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let value = text
                        .decode()
                        .map_err(|e| ExtractorError::Xml(e.to_string()))?;
                    current.text.push_str(&value);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(data.as_ref()));
                }
            }
            Event::GeneralRef(reference) => {
                if let Some(current) = stack.last_mut() {
                    if let Some(resolved) = resolve_reference(reference.as_ref()) {
                        current.text.push(resolved);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    match root {
        Some(mut element) => {
            element.text = element.text.trim().to_string();
            Ok((element, prefix_map))
        }
        None => Err(ExtractorError::Xml("document has no root element".into())),
    }
}

/// Build an element from a start tag, pushing its namespace declarations
/// onto the scope stack and recording them in the document prefix map.
fn open_element(
    start: &quick_xml::events::BytesStart<'_>,
    scopes: &mut Vec<HashMap<String, String>>,
    prefix_map: &mut HashMap<String, String>,
) -> Result<Element> {
    let qualified = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    let mut declared: HashMap<String, String> = HashMap::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| ExtractorError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| ExtractorError::Xml(e.to_string()))?
            .into_owned();
        if key == "xmlns" {
            declared.insert(String::new(), value.clone());
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared.insert(prefix.to_string(), value.clone());
        }
        attributes.push((key, value));
    }
    for (prefix, uri) in &declared {
        prefix_map
            .entry(prefix.clone())
            .or_insert_with(|| uri.clone());
    }
    scopes.push(declared);

    let (prefix, local) = match qualified.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, qualified.clone()),
    };
    let namespace = lookup_namespace(scopes, prefix.as_deref());
    Ok(Element {
        qualified,
        local,
        prefix,
        namespace,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn attach(stack: &mut Vec<Element>, root: &mut Option<Element>, mut element: Element) {
    element.text = element.text.trim().to_string();
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

fn lookup_namespace(scopes: &[HashMap<String, String>], prefix: Option<&str>) -> Option<String> {
    let key = prefix.unwrap_or("");
    scopes
        .iter()
        .rev()
        .find_map(|scope| scope.get(key))
        .cloned()
}

/// Resolve a general entity reference to its character, covering the
/// predefined XML entities and numeric character references.
fn resolve_reference(reference: &[u8]) -> Option<char> {
    match reference {
        b"amp" => Some('&'),
        b"lt" => Some('<'),
        b"gt" => Some('>'),
        b"quot" => Some('"'),
        b"apos" => Some('\''),
        _ => {
            let reference = std::str::from_utf8(reference).ok()?;
            let digits = reference.strip_prefix('#')?;
            let value = match digits.strip_prefix('x').or_else(|| digits.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse().ok()?,
            };
            char::from_u32(value)
        }
    }
}
