//! System view XML
//!
//! Every node is an `sv:node` element named by `sv:name`; every property an
//! `sv:property` element with `sv:name`, `sv:type` and one `sv:value` child
//! per value. The primary type, mixins and identifier travel as ordinary
//! properties in the document and are lifted into [`NodeInfo`] fields.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::writer::Writer;
use std::collections::BTreeSet;
use std::io::Cursor;

use super::NodeInfo;
use crate::error::{Result, StateError};
use crate::id::{names, Name, NodeId};
use crate::reconcile::PropInfo;
use crate::value::{PropertyType, RawValue};

/// System view namespace
pub const SV_NS: &str = "http://www.strata.dev/sv/1.0";

struct PendingProperty {
    name: Name,
    property_type: PropertyType,
    values: Vec<RawValue>,
}

fn invalid(msg: impl std::fmt::Display) -> StateError {
    StateError::ValueFormat(format!("invalid system view: {}", msg))
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    match e.try_get_attribute(key).map_err(invalid)? {
        Some(attr) => Ok(Some(attr.unescape_value().map_err(invalid)?.into_owned())),
        None => Ok(None),
    }
}

fn required_attribute(e: &BytesStart<'_>, key: &str) -> Result<String> {
    attribute(e, key)?.ok_or_else(|| {
        invalid(format!(
            "<{}> without {}",
            String::from_utf8_lossy(e.name().as_ref()),
            key
        ))
    })
}

/// Parse a system view document into its root node
pub fn parse(xml: &str) -> Result<NodeInfo> {
    // untrimmed: value text is kept verbatim, layout text outside sv:value is dropped below
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<NodeInfo> = Vec::new();
    let mut root: Option<NodeInfo> = None;
    let mut property: Option<PendingProperty> = None;
    let mut value: Option<String> = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"sv:node" => {
                    if root.is_some() {
                        return Err(invalid("more than one root node"));
                    }
                    let name = required_attribute(e, "sv:name")?;
                    stack.push(NodeInfo::new(Name::from(name), Name::from("")));
                }
                b"sv:property" => {
                    let name = required_attribute(e, "sv:name")?;
                    let property_type = match attribute(e, "sv:type")? {
                        Some(ty) => PropertyType::from_name(&ty)?,
                        None => PropertyType::Undefined,
                    };
                    property = Some(PendingProperty {
                        name: Name::from(name),
                        property_type,
                        values: Vec::new(),
                    });
                }
                b"sv:value" => value = Some(String::new()),
                other => {
                    return Err(invalid(format!("unexpected element <{}>", String::from_utf8_lossy(other))));
                }
            },
            Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"sv:value" => {
                    if let Some(prop) = property.as_mut() {
                        prop.values.push(RawValue::new(""));
                    }
                }
                b"sv:property" => {
                    let name = required_attribute(e, "sv:name")?;
                    let node = stack.last_mut().ok_or_else(|| invalid("property outside a node"))?;
                    node.props.push(PropInfo::new(name, PropertyType::Undefined, Vec::new()));
                }
                b"sv:node" => {
                    let name = required_attribute(e, "sv:name")?;
                    return Err(invalid(format!("node {} has no primary type", name)));
                }
                other => {
                    return Err(invalid(format!("unexpected element <{}>", String::from_utf8_lossy(other))));
                }
            },
            Ok(Event::Text(ref text)) => {
                if let Some(v) = value.as_mut() {
                    v.push_str(&text.unescape().map_err(invalid)?);
                }
            }
            Ok(Event::CData(ref data)) => {
                if let Some(v) = value.as_mut() {
                    v.push_str(&String::from_utf8_lossy(data));
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"sv:value" => {
                    if let (Some(prop), Some(v)) = (property.as_mut(), value.take()) {
                        prop.values.push(RawValue::new(v));
                    }
                }
                b"sv:property" => {
                    let prop = property.take().ok_or_else(|| invalid("unbalanced </sv:property>"))?;
                    let node = stack.last_mut().ok_or_else(|| invalid("property outside a node"))?;
                    lift_property(node, prop)?;
                }
                b"sv:node" => {
                    let node = stack.pop().ok_or_else(|| invalid("unbalanced </sv:node>"))?;
                    if node.primary_type.as_str().is_empty() {
                        return Err(invalid(format!("node {} has no primary type", node.name)));
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = Some(node),
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(invalid(e)),
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(invalid("unexpected end of document"));
    }
    root.ok_or_else(|| invalid("no sv:node element"))
}

/// Move system properties into the node's own fields
fn lift_property(node: &mut NodeInfo, prop: PendingProperty) -> Result<()> {
    match prop.name.as_str() {
        names::PRIMARY_TYPE => {
            let value = prop
                .values
                .first()
                .ok_or_else(|| invalid(format!("empty primary type on {}", node.name)))?;
            node.primary_type = Name::from(value.as_str());
        }
        names::MIXIN_TYPES => {
            node.mixins = prop.values.iter().map(|v| Name::from(v.as_str())).collect::<BTreeSet<_>>();
        }
        names::UUID => {
            let value = prop
                .values
                .first()
                .ok_or_else(|| invalid(format!("empty identifier on {}", node.name)))?;
            node.id = Some(NodeId::parse(value.as_str())?);
        }
        _ => node
            .props
            .push(PropInfo::new(prop.name, prop.property_type, prop.values)),
    }
    Ok(())
}

/// Serialize `node` and its subtree as a system view document
pub fn to_xml(node: &NodeInfo) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    write_node(&mut writer, node, true).map_err(|e| StateError::Serialization(e.to_string()))?;
    Ok(String::from_utf8_lossy(writer.into_inner().get_ref()).to_string())
}

fn write_node<W: std::io::Write>(writer: &mut Writer<W>, node: &NodeInfo, root: bool) -> std::io::Result<()> {
    let mut element = writer
        .create_element("sv:node")
        .with_attribute(("sv:name", node.name.as_str()));
    if root {
        element = element.with_attribute(("xmlns:sv", SV_NS));
    }
    element.write_inner_content(|w| -> std::io::Result<()> {
        let primary = [node.primary_type.to_string()];
        write_property(w, names::PRIMARY_TYPE, PropertyType::Name, primary.iter().map(String::as_str))?;
        if !node.mixins.is_empty() {
            write_property(
                w,
                names::MIXIN_TYPES,
                PropertyType::Name,
                node.mixins.iter().map(|m| m.as_str()),
            )?;
        }
        if let Some(id) = node.id {
            let id = [id.to_string()];
            write_property(w, names::UUID, PropertyType::String, id.iter().map(String::as_str))?;
        }
        for prop in &node.props {
            write_property(
                w,
                prop.name.as_str(),
                prop.nominal_type,
                prop.values.iter().map(|v| v.as_str()),
            )?;
        }
        for child in &node.children {
            write_node(w, child, false)?;
        }
        Ok(())
    })?;
    Ok(())
}

fn write_property<'v, W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    property_type: PropertyType,
    values: impl Iterator<Item = &'v str>,
) -> std::io::Result<()> {
    writer
        .create_element("sv:property")
        .with_attribute(("sv:name", name))
        .with_attribute(("sv:type", property_type.name()))
        .write_inner_content(|w| -> std::io::Result<()> {
            for value in values {
                w.create_element("sv:value").write_text_content(BytesText::new(value))?;
            }
            Ok(())
        })?;
    Ok(())
}
