//! On-disk settings document
//!
//! The document is a plain element tree mirroring the settings namespace.
//! Migrations rewrite it before the [`Tree`] is built from it, so it offers
//! the small set of editing helpers those rewrites need.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <Settings version="9">
//!   <System>
//!     <Units type="i" min="0" max="2" default="0">1</Units>
//!   </System>
//!   <Tank>
//!     <_1>
//!       <FluidType2 type="i" default="0">3</FluidType2>
//!     </_1>
//!   </Tank>
//! </Settings>
//! ```

use crate::error::PersistError;
use crate::migration::OLDEST_VERSION;
use crate::node::{Node, NodeId, SettingAttributes};
use crate::tree::Tree;
use crate::value::{Value, ValueType};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::warn;

/// Tag of the document root
pub const ROOT_TAG: &str = "Settings";

/// Escape a path segment that is not a valid XML name
pub fn tag_for_xml(name: &str) -> String {
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{}", name)
    } else {
        name.to_string()
    }
}

/// Path segment for an element tag
pub fn name_from_xml(tag: &str) -> &str {
    tag.strip_prefix('_').unwrap_or(tag)
}

/// A document element
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Leaf element with a `type` attribute and text
    pub fn leaf(tag: impl Into<String>, value: impl ToString, value_type: ValueType) -> Self {
        let mut element = Self::new(tag);
        element.set_attr("type", value_type.code());
        element.text = Some(value.to_string());
        element
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let index = self.attributes.iter().position(|(k, _)| k == name)?;
        Some(self.attributes.remove(index).1)
    }

    /// Text content, empty when absent
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// Leaves carry a `type` attribute; everything else is a group
    pub fn is_leaf(&self) -> bool {
        self.attr("type").is_some()
    }

    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn child_mut(&mut self, tag: &str) -> Option<&mut Element> {
        self.children.iter_mut().find(|c| c.tag == tag)
    }

    pub fn child_or_insert(&mut self, tag: &str) -> &mut Element {
        let index = match self.children.iter().position(|c| c.tag == tag) {
            Some(index) => index,
            None => {
                self.children.push(Element::new(tag));
                self.children.len() - 1
            }
        };
        &mut self.children[index]
    }

    /// Descendant at a slash-separated tag path relative to this element
    pub fn find(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |element, tag| element.child(tag))
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Element> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |element, tag| element.child_mut(tag))
    }

    /// Text of the descendant at `path`
    pub fn find_text(&self, path: &str) -> Option<&str> {
        self.find(path).map(Element::text)
    }

    /// Tag paths matching `pattern`, where a `*` segment matches any child
    pub fn expand(&self, pattern: &str) -> Vec<String> {
        let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        let mut result = Vec::new();
        self.expand_into(&segments, String::new(), &mut result);
        result
    }

    fn expand_into(&self, segments: &[&str], prefix: String, out: &mut Vec<String>) {
        let Some((first, rest)) = segments.split_first() else {
            out.push(prefix);
            return;
        };
        for child in &self.children {
            if *first == "*" || child.tag == *first {
                let path = if prefix.is_empty() {
                    child.tag.clone()
                } else {
                    format!("{}/{}", prefix, child.tag)
                };
                child.expand_into(rest, path, out);
            }
        }
    }

    /// Detach the descendant at `path`
    pub fn remove(&mut self, path: &str) -> Option<Element> {
        let (parent, tag) = match path.trim_matches('/').rsplit_once('/') {
            Some((parent, tag)) => (self.find_mut(parent)?, tag),
            None => (self, path.trim_matches('/')),
        };
        let index = parent.children.iter().position(|c| c.tag == tag)?;
        Some(parent.children.remove(index))
    }

    /// Detach the descendant at `path`, then drop ancestors left without
    /// children. This element itself is never dropped.
    pub fn remove_and_prune(&mut self, path: &str) -> Option<Element> {
        let removed = self.remove(path)?;
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        segments.pop();
        while !segments.is_empty() {
            let ancestor = segments.join("/");
            let empty = matches!(
                self.find(&ancestor),
                Some(e) if e.children.is_empty() && !e.is_leaf()
            );
            if !empty {
                break;
            }
            self.remove(&ancestor);
            segments.pop();
        }
        Some(removed)
    }

    /// Create or overwrite the leaf at `path`, creating groups on the way
    pub fn set_leaf(&mut self, path: &str, value: impl ToString, value_type: ValueType) {
        let leaf = self.path_or_insert(path);
        leaf.set_attr("type", value_type.code());
        leaf.text = Some(value.to_string());
    }

    /// Create the leaf at `path` unless something already exists there
    pub fn insert_leaf_if_absent(&mut self, path: &str, value: impl ToString, value_type: ValueType) {
        if self.find(path).is_none() {
            self.set_leaf(path, value, value_type);
        }
    }

    fn path_or_insert(&mut self, path: &str) -> &mut Element {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(self, |element, tag| element.child_or_insert(tag))
    }

    /// Rename the descendant at `path`, replacing any sibling that already
    /// carries the new tag. Returns false if `path` does not exist.
    pub fn rename(&mut self, path: &str, new_tag: &str) -> bool {
        let path = path.trim_matches('/');
        let parent_path = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        let Some(parent) = self.find_mut(parent_path) else {
            return false;
        };
        let old_tag = path.rsplit('/').next().unwrap_or(path);
        if old_tag == new_tag {
            return parent.child(old_tag).is_some();
        }
        if parent.child(old_tag).is_none() {
            return false;
        }
        parent.children.retain(|c| c.tag != new_tag);
        match parent.child_mut(old_tag) {
            Some(element) => {
                element.tag = new_tag.to_string();
                true
            }
            None => false,
        }
    }
}

/// The settings document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub root: Element,
}

impl Document {
    /// Document with no settings
    pub fn empty(version: u32) -> Self {
        let mut root = Element::new(ROOT_TAG);
        root.set_attr("version", version.to_string());
        Self { root }
    }

    /// Raw `version` attribute text
    pub fn version_text(&self) -> Option<&str> {
        self.root.attr("version")
    }

    /// Integer major part of the `version` attribute. Files that predate
    /// versioning report the oldest supported version.
    pub fn version(&self) -> u32 {
        self.version_text()
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.trim().parse().ok())
            .unwrap_or(OLDEST_VERSION)
    }

    pub fn set_version(&mut self, version: u32) {
        self.root.set_attr("version", version.to_string());
    }

    /// Parse a document from XML text
    pub fn parse(xml: &str) -> Result<Self, PersistError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    stack.push(element_from_start(e)?);
                }
                Ok(Event::Empty(ref e)) => {
                    let element = element_from_start(e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let mut element = stack
                        .pop()
                        .ok_or_else(|| PersistError::Xml("Unbalanced end tag".into()))?;
                    if !element.children.is_empty()
                        || (!element.is_leaf() && element.text().trim().is_empty())
                    {
                        element.text = None;
                    }
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(ref e)) => {
                    if let Some(current) = stack.last_mut() {
                        let text = e.decode().map_err(xml_err)?;
                        current.text.get_or_insert_with(String::new).push_str(&text);
                    }
                }
                Ok(Event::CData(ref e)) => {
                    if let Some(current) = stack.last_mut() {
                        let text = String::from_utf8_lossy(e.as_ref());
                        current.text.get_or_insert_with(String::new).push_str(&text);
                    }
                }
                Ok(Event::GeneralRef(ref e)) => {
                    let resolved = resolve_reference(e)?;
                    if let Some(current) = stack.last_mut() {
                        current.text.get_or_insert_with(String::new).push_str(&resolved);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(xml_err(e)),
            }
        }

        if !stack.is_empty() {
            return Err(PersistError::Xml("Unexpected end of document".into()));
        }
        let root = root.ok_or(PersistError::EmptyDocument)?;
        if root.tag != ROOT_TAG {
            return Err(PersistError::UnexpectedRoot(root.tag));
        }
        Ok(Self { root })
    }

    /// Serialize to indented XML
    pub fn to_xml(&self) -> Result<String, PersistError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;
        write_element(&mut writer, &self.root)?;
        let mut bytes = writer.into_inner();
        bytes.push(b'\n');
        String::from_utf8(bytes).map_err(xml_err)
    }

    /// Snapshot the persisted subtree of `tree`, children sorted by tag
    pub fn from_tree(tree: &Tree, version: u32) -> Self {
        let mut document = Self::empty(version);
        document.root.children = element_children(tree, tree.settings_root());
        document
    }

    /// Build a tree from this document. Entries with an unknown type are
    /// dropped; unparsable values fall back to their default.
    pub fn build_tree(&self) -> Tree {
        let mut tree = Tree::new();
        let settings = tree.settings_root();
        for child in &self.root.children {
            load_element(&mut tree, settings, child);
        }
        tree.take_events();
        tree.take_added();
        tree.take_dirty();
        tree
    }
}

fn element_from_start(e: &BytesStart<'_>) -> Result<Element, PersistError> {
    let mut element = Element::new(String::from_utf8_lossy(e.name().as_ref()));
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value().map_err(xml_err)?.to_string();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn resolve_reference(e: &quick_xml::events::BytesRef<'_>) -> Result<String, PersistError> {
    if let Some(ch) = e.resolve_char_ref().map_err(xml_err)? {
        return Ok(ch.to_string());
    }
    let name = String::from_utf8_lossy(e.as_ref()).to_string();
    quick_xml::escape::resolve_predefined_entity(&name)
        .map(str::to_string)
        .ok_or_else(|| PersistError::Xml(format!("Unknown entity &{};", name)))
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), PersistError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(PersistError::Xml("Multiple root elements".into())),
    }
}

fn xml_err(e: impl std::fmt::Display) -> PersistError {
    PersistError::Xml(e.to_string())
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<(), PersistError> {
    let mut start = BytesStart::new(element.tag.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    let text = element.text.as_deref().filter(|t| !t.is_empty());
    if element.children.is_empty() && text.is_none() {
        return writer.write_event(Event::Empty(start)).map_err(xml_err);
    }

    writer.write_event(Event::Start(start)).map_err(xml_err)?;
    if element.children.is_empty() {
        if let Some(text) = text {
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(xml_err)?;
        }
    } else {
        for child in &element.children {
            write_element(writer, child)?;
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.tag.as_str())))
        .map_err(xml_err)
}

fn element_children(tree: &Tree, group: NodeId) -> Vec<Element> {
    let Some(group) = tree.group(group) else {
        return Vec::new();
    };
    let mut children: Vec<Element> = group
        .children()
        .filter_map(|(name, id)| match tree.node(id)? {
            Node::Group(_) => {
                let mut element = Element::new(tag_for_xml(name));
                element.children = element_children(tree, id);
                Some(element)
            }
            Node::Setting(setting) => {
                let attributes = setting.attributes();
                let mut element = Element::leaf(
                    tag_for_xml(name),
                    setting.value(),
                    attributes.value_type,
                );
                if let Some(min) = &attributes.min {
                    element.set_attr("min", min.to_string());
                }
                if let Some(max) = &attributes.max {
                    element.set_attr("max", max.to_string());
                }
                if let Some(default) = &attributes.default {
                    element.set_attr("default", default.to_string());
                }
                if attributes.silent {
                    element.set_attr("silent", "True");
                }
                Some(element)
            }
        })
        .collect();
    children.sort_by(|a, b| a.tag.cmp(&b.tag));
    children
}

fn load_element(tree: &mut Tree, group: NodeId, element: &Element) {
    let name = name_from_xml(&element.tag);
    if name.is_empty() {
        return;
    }

    if !element.is_leaf() {
        if let Some(subgroup) = tree.child_group(group, name) {
            for child in &element.children {
                load_element(tree, subgroup, child);
            }
        }
        return;
    }

    let code = element.attr("type").unwrap_or_default();
    let Some(value_type) = ValueType::from_code(code) else {
        warn!("Ignoring {} with unknown type {:?}", element.tag, code);
        return;
    };

    let parse_attr = |key: &str| element.attr(key).and_then(|v| Value::parse(value_type, v));
    let default = parse_attr("default");
    let (min, max) = if value_type.is_numeric() {
        (parse_attr("min"), parse_attr("max"))
    } else {
        (None, None)
    };

    let value = match Value::parse(value_type, element.text()) {
        Some(value) => value,
        None => match &default {
            Some(default) => {
                warn!(
                    "Invalid value {:?} for {}, using default {}",
                    element.text(),
                    element.tag,
                    default
                );
                default.clone()
            }
            None => {
                warn!("Invalid value {:?} for {}, ignored", element.text(), element.tag);
                return;
            }
        },
    };

    let attributes = SettingAttributes {
        value_type,
        default,
        min,
        max,
        silent: element.attr("silent").map(parse_bool).unwrap_or(false),
    };
    tree.attach_loaded(group, name, value, attributes);
}

/// Accepts `1`/`0` as well as `True`/`False` in any case
pub(crate) fn parse_bool(text: &str) -> bool {
    match text.trim().parse::<i64>() {
        Ok(n) => n != 0,
        Err(_) => text.trim().eq_ignore_ascii_case("true"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{AddOptions, SettingDefinition};

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Settings version="1.0">
  <System>
    <Units type="i" min="0" max="2" default="0">1</Units>
    <Name type="s" default="">  padded  </Name>
  </System>
  <Tank>
    <_1>
      <Level type="f" default="0.0">12.5</Level>
    </_1>
  </Tank>
  <Gui>
    <Position type="i" default="0" silent="True">3</Position>
    <Broken type="b">x</Broken>
    <Label type="s">a &amp; b</Label>
  </Gui>
</Settings>
"#;

    #[test]
    fn test_parse_sample() {
        let document = Document::parse(SAMPLE).unwrap();
        assert_eq!(document.version_text(), Some("1.0"));
        assert_eq!(document.version(), 1);
        assert_eq!(document.root.find_text("System/Units"), Some("1"));
        assert_eq!(document.root.find_text("System/Name"), Some("  padded  "));
        assert_eq!(document.root.find_text("Gui/Label"), Some("a & b"));
        assert!(document.root.find("Tank/_1/Level").unwrap().is_leaf());
        assert!(!document.root.find("Tank/_1").unwrap().is_leaf());
    }

    #[test]
    fn test_version_defaults_to_oldest() {
        let document = Document::parse("<Settings/>").unwrap();
        assert_eq!(document.version(), OLDEST_VERSION);
        let document = Document::parse(r#"<Settings version="junk"/>"#).unwrap();
        assert_eq!(document.version(), OLDEST_VERSION);
        let document = Document::parse(r#"<Settings version="7"/>"#).unwrap();
        assert_eq!(document.version(), 7);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Document::parse("").is_err());
        assert!(Document::parse("<Settings><System></Settings>").is_err());
        assert!(matches!(
            Document::parse("<Other/>"),
            Err(PersistError::UnexpectedRoot(_))
        ));
    }

    #[test]
    fn test_build_tree_from_document() {
        let tree = Document::parse(SAMPLE).unwrap().build_tree();

        let units = tree.get("/Settings/System/Units").unwrap();
        assert_eq!(units.value(), &Value::Integer(1));
        assert_eq!(units.max(), Some(&Value::Integer(2)));

        let level = tree.get("/Settings/Tank/1/Level").unwrap();
        assert_eq!(level.value(), &Value::Float(12.5));

        assert!(tree.get("/Settings/Gui/Position").unwrap().silent());
        assert!(tree.get("/Settings/Gui/Broken").is_none());
        assert_eq!(tree.get("/Settings/System/Name").unwrap().text(), "  padded  ");
    }

    #[test]
    fn test_unparsable_value_falls_back_to_default() {
        let xml = r#"<Settings version="9"><A><B type="i" default="4">oops</B><C type="i">oops</C></A></Settings>"#;
        let tree = Document::parse(xml).unwrap().build_tree();
        assert_eq!(tree.get("/Settings/A/B").unwrap().value(), &Value::Integer(4));
        assert!(tree.get("/Settings/A/C").is_none());
    }

    #[test]
    fn test_tree_roundtrip_is_identical() {
        let mut tree = Tree::new();
        let options = AddOptions::default();
        let defs = [
            ("/Settings/System/Units", SettingDefinition::new(0, "i").with_bounds(0, 2)),
            ("/Settings/Tank/1/FluidType", SettingDefinition::new(0, "i")),
            ("/Settings/Tank/1/Capacity", SettingDefinition::new(0.2, "f").with_bounds(0.0, 1000.0)),
            ("/Settings/Gui/Position", SettingDefinition::new(0, "i").with_silent(true)),
            ("/Settings/Gui/Label", SettingDefinition::new("<a & b>", "s")),
            ("/Settings/Gui/Empty", SettingDefinition::new("", "s")),
            ("/Settings/Ratio", SettingDefinition::new(1.0, "f")),
        ];
        for (path, def) in &defs {
            tree.add_setting(path, def, &options).unwrap();
        }
        tree.set_value("/Settings/System/Units", &Value::Integer(2)).unwrap();
        tree.set_value("/Settings/Tank/1/Capacity", &Value::Float(0.35)).unwrap();

        let xml = Document::from_tree(&tree, 9).to_xml().unwrap();
        assert!(xml.contains("<_1>"));
        let reloaded = Document::parse(&xml).unwrap().build_tree();

        let before = tree.for_all_settings("/", |s| Some((s.value().clone(), s.attributes().clone())));
        let restored =
            reloaded.for_all_settings("/", |s| Some((s.value().clone(), s.attributes().clone())));
        assert_eq!(before, restored);
    }

    #[test]
    fn test_serialization_is_sorted() {
        let mut tree = Tree::new();
        let options = AddOptions::default();
        for path in ["/Settings/Zeta/A", "/Settings/Alpha/B", "/Settings/Mid/C"] {
            tree.add_setting(path, &SettingDefinition::new(1, "i"), &options)
                .unwrap();
        }
        let xml = Document::from_tree(&tree, 9).to_xml().unwrap();
        let alpha = xml.find("<Alpha>").unwrap();
        let mid = xml.find("<Mid>").unwrap();
        let zeta = xml.find("<Zeta>").unwrap();
        assert!(alpha < mid && mid < zeta);
        assert!(xml.contains(r#"<Settings version="9">"#));
    }

    #[test]
    fn test_element_helpers() {
        let mut document = Document::parse(SAMPLE).unwrap();
        let root = &mut document.root;

        root.set_leaf("Services/MqttLocal", 1, ValueType::Integer);
        assert_eq!(root.find_text("Services/MqttLocal"), Some("1"));
        root.insert_leaf_if_absent("Services/MqttLocal", 0, ValueType::Integer);
        assert_eq!(root.find_text("Services/MqttLocal"), Some("1"));

        assert!(root.rename("System/Units", "Name"));
        assert_eq!(root.find_text("System/Name"), Some("1"));
        assert_eq!(root.find("System").unwrap().children.len(), 1);
        assert!(!root.rename("System/Missing", "Other"));

        assert_eq!(root.expand("Tank/*/Level"), vec!["Tank/_1/Level".to_string()]);

        assert!(root.remove_and_prune("Tank/_1/Level").is_some());
        assert!(root.find("Tank").is_none());
        assert!(root.remove_and_prune("Tank/_1/Level").is_none());
    }

    #[test]
    fn test_digit_escaping() {
        assert_eq!(tag_for_xml("1"), "_1");
        assert_eq!(tag_for_xml("Tank"), "Tank");
        assert_eq!(name_from_xml("_1"), "1");
        assert_eq!(name_from_xml("Tank"), "Tank");
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("True"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("False"));
        assert!(!parse_bool("0"));
    }
}
