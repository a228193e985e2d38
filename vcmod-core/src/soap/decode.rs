//! Response decoding: SOAP XML to `Value`, faults to [`Fault`].

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Fault, Result};
use crate::value::{MOREF_TYPE, TYPE_KEY};

/// Minimal element tree built while reading the response.
#[derive(Debug, Default)]
struct Node {
    name: String,
    xsi_type: Option<String>,
    moref_type: Option<String>,
    text: String,
    children: Vec<Node>,
}

/// Decoded body of a SOAP response.
#[derive(Debug)]
pub enum Body {
    Return(Value),
    Fault(Fault),
}

/// Decode a complete SOAP response document.
pub fn decode_response(xml: &str) -> Result<Body> {
    let root = parse_tree(xml)?;
    let body = find_child(&root, "Body")
        .ok_or_else(|| Error::Internal("SOAP response without Body".to_string()))?;
    let first = body
        .children
        .first()
        .ok_or_else(|| Error::Internal("SOAP response with empty Body".to_string()))?;

    if first.name == "Fault" {
        return Ok(Body::Fault(decode_fault(first)));
    }

    let returns: Vec<&Node> = first
        .children
        .iter()
        .filter(|c| c.name == "returnval")
        .collect();
    let value = match returns.len() {
        0 => Value::Null,
        1 => node_to_value(returns[0]),
        _ => Value::Array(returns.into_iter().map(node_to_value).collect()),
    };
    Ok(Body::Return(value))
}

fn decode_fault(node: &Node) -> Fault {
    let message = find_child(node, "faultstring")
        .map(|n| n.text.trim().to_string())
        .unwrap_or_default();
    let detail_node = find_child(node, "detail").and_then(|d| d.children.first());
    match detail_node {
        Some(detail) => {
            let name = detail
                .xsi_type
                .clone()
                .unwrap_or_else(|| detail.name.trim_end_matches("Fault").to_string());
            let mut value = node_to_value(detail);
            if let Value::Object(map) = &mut value {
                map.remove(TYPE_KEY);
            }
            Fault::new(name, message).with_detail(value)
        }
        None => {
            let code = find_child(node, "faultcode")
                .map(|n| n.text.trim().to_string())
                .unwrap_or_else(|| "MethodFault".to_string());
            let name = code.rsplit(':').next().unwrap_or(&code).to_string();
            Fault::new(name, message)
        }
    }
}

fn find_child<'a>(node: &'a Node, name: &str) -> Option<&'a Node> {
    node.children.iter().find(|c| c.name == name)
}

fn node_to_value(node: &Node) -> Value {
    if node.children.is_empty() {
        if let Some(kind) = &node.moref_type {
            let mut map = Map::new();
            map.insert(TYPE_KEY.into(), Value::String(MOREF_TYPE.into()));
            map.insert("type".into(), Value::String(kind.clone()));
            map.insert("value".into(), Value::String(node.text.clone()));
            return Value::Object(map);
        }
        return typed_scalar(node.xsi_type.as_deref(), &node.text);
    }

    let mut map = Map::new();
    if let Some(t) = &node.xsi_type {
        map.insert(TYPE_KEY.into(), Value::String(t.clone()));
    }
    for child in &node.children {
        let value = node_to_value(child);
        match map.get_mut(&child.name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(child.name.clone(), value);
            }
        }
    }
    Value::Object(map)
}

fn typed_scalar(xsi_type: Option<&str>, text: &str) -> Value {
    let local = xsi_type.map(|t| t.rsplit(':').next().unwrap_or(t));
    match local {
        Some("int" | "long" | "short" | "byte") => text
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .unwrap_or_else(|_| Value::String(text.to_string())),
        Some("float" | "double") => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        Some("boolean") => match text.trim() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        _ => Value::String(text.to_string()),
    }
}

fn start_node(e: &BytesStart<'_>) -> Result<Node> {
    let name = String::from_utf8_lossy(e.local_name().into_inner()).to_string();
    let mut node = Node {
        name,
        ..Default::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Internal(format!("XML attribute error: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.local_name().into_inner()).to_string();
        let is_xsi = attr
            .key
            .prefix()
            .map(|p| p.into_inner() == b"xsi")
            .unwrap_or(false);
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Internal(format!("XML attribute error: {e}")))?
            .to_string();
        match (key.as_str(), is_xsi) {
            ("type", true) => node.xsi_type = Some(value),
            ("type", false) => node.moref_type = Some(value),
            _ => {}
        }
    }
    // A reference tagged with its xsi type still carries the object type.
    if node.xsi_type.as_deref() == Some(MOREF_TYPE) && node.moref_type.is_none() {
        node.xsi_type = None;
    }
    Ok(node)
}

fn parse_tree(xml: &str) -> Result<Node> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Node> = vec![Node::default()];
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => stack.push(start_node(e)?),
            Ok(Event::Empty(ref e)) => {
                let node = start_node(e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| Error::Internal(format!("XML text error: {e}")))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(ref e)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| Error::Internal("unbalanced XML".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => return Err(Error::Internal("unbalanced XML".to_string())),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Internal(format!("XML parse error: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    let mut root = stack
        .pop()
        .ok_or_else(|| Error::Internal("empty XML document".to_string()))?;
    if !stack.is_empty() {
        return Err(Error::Internal("truncated XML document".to_string()));
    }
    // The synthetic root holds the Envelope element.
    match root.children.pop() {
        Some(envelope) => Ok(envelope),
        None => Err(Error::Internal("empty XML document".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{MoRef, ValueExt};

    fn wrap(body: &str) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
                r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
                "<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"
            ),
            body
        )
    }

    #[test]
    fn test_decode_moref_return() {
        let xml = wrap(
            r#"<CreateClusterExResponse xmlns="urn:vim25"><returnval type="ClusterComputeResource">domain-c7</returnval></CreateClusterExResponse>"#,
        );
        let Body::Return(v) = decode_response(&xml).unwrap() else {
            panic!("expected return")
        };
        assert_eq!(
            MoRef::from_value(&v),
            Some(MoRef::new("ClusterComputeResource", "domain-c7"))
        );
    }

    #[test]
    fn test_decode_repeated_children_become_array() {
        let xml = wrap(concat!(
            r#"<RetrievePropertiesExResponse xmlns="urn:vim25"><returnval>"#,
            r#"<objects><obj type="Datacenter">datacenter-1</obj><propSet><name>name</name><val xsi:type="xsd:string">R&amp;D</val></propSet></objects>"#,
            r#"<objects><obj type="Datacenter">datacenter-2</obj><propSet><name>name</name><val xsi:type="xsd:string">DC0</val></propSet></objects>"#,
            r#"</returnval></RetrievePropertiesExResponse>"#
        ));
        let Body::Return(v) = decode_response(&xml).unwrap() else {
            panic!("expected return")
        };
        let objects = v.list_at("objects");
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].str_at("propSet.val"), Some("R&D"));
    }

    #[test]
    fn test_decode_typed_scalars() {
        let xml = wrap(concat!(
            r#"<X xmlns="urn:vim25"><returnval xsi:type="OptionValue">"#,
            r#"<key>n</key><value xsi:type="xsd:int">42</value></returnval></X>"#
        ));
        let Body::Return(v) = decode_response(&xml).unwrap() else {
            panic!("expected return")
        };
        assert_eq!(v.type_name(), Some("OptionValue"));
        assert_eq!(v["value"], Value::from(42));
    }

    #[test]
    fn test_decode_fault_with_detail() {
        let xml = wrap(concat!(
            "<soapenv:Fault><faultcode>ServerFaultCode</faultcode>",
            "<faultstring>Cannot complete login due to an incorrect user name or password.</faultstring>",
            r#"<detail><InvalidLoginFault xmlns="urn:vim25" xsi:type="InvalidLogin"></InvalidLoginFault></detail>"#,
            "</soapenv:Fault>"
        ));
        let Body::Fault(fault) = decode_response(&xml).unwrap() else {
            panic!("expected fault")
        };
        assert_eq!(fault.name, "InvalidLogin");
        assert!(fault.message.starts_with("Cannot complete login"));
    }

    #[test]
    fn test_decode_fault_without_detail_uses_code() {
        let xml = wrap(
            "<soapenv:Fault><faultcode>soapenv:Client</faultcode><faultstring>bad</faultstring></soapenv:Fault>",
        );
        let Body::Fault(fault) = decode_response(&xml).unwrap() else {
            panic!("expected fault")
        };
        assert_eq!(fault.name, "Client");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_response("<not-soap").is_err());
    }
}
