//! Request encoding: a method call plus `Value` arguments to a SOAP envelope.

use quick_xml::escape::escape;
use serde_json::Value;

use crate::value::{MOREF_TYPE, MoRef, TYPE_KEY};

const ENVELOPE_OPEN: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
    r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
    r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
    "<soapenv:Body>"
);
const ENVELOPE_CLOSE: &str = "</soapenv:Body></soapenv:Envelope>";

/// Encode `method` invoked on `this` with ordered arguments.
pub fn encode_call(namespace: &str, method: &str, this: &MoRef, args: &[(String, Value)]) -> String {
    let mut out = String::with_capacity(512);
    out.push_str(ENVELOPE_OPEN);
    out.push('<');
    out.push_str(method);
    out.push_str(" xmlns=\"");
    out.push_str(&escape(namespace));
    out.push_str("\">");
    encode_value(&mut out, "_this", &this.to_value());
    for (name, value) in args {
        encode_value(&mut out, name, value);
    }
    out.push_str("</");
    out.push_str(method);
    out.push('>');
    out.push_str(ENVELOPE_CLOSE);
    out
}

/// Encode one named element. Null values are omitted, arrays repeat the
/// element, `_type` becomes `xsi:type`.
pub fn encode_value(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => push_leaf(out, name, None, if *b { "true" } else { "false" }),
        Value::Number(n) => push_leaf(out, name, None, &n.to_string()),
        Value::String(s) => push_leaf(out, name, None, s),
        Value::Array(items) => {
            for item in items {
                encode_value(out, name, item);
            }
        }
        Value::Object(map) => {
            let type_name = map.get(TYPE_KEY).and_then(Value::as_str);
            if type_name == Some(MOREF_TYPE)
                && let Some(moref) = MoRef::from_value(value)
            {
                out.push('<');
                out.push_str(name);
                out.push_str(" type=\"");
                out.push_str(&escape(moref.kind.as_str()));
                out.push_str("\">");
                out.push_str(&escape(moref.value.as_str()));
                out.push_str("</");
                out.push_str(name);
                out.push('>');
                return;
            }
            // Typed scalar in an anyType slot.
            if let Some(inner) = map.get("_value") {
                let text = match inner {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                push_leaf(out, name, type_name, &text);
                return;
            }
            out.push('<');
            out.push_str(name);
            if let Some(t) = type_name {
                out.push_str(" xsi:type=\"");
                out.push_str(&escape(t));
                out.push('"');
            }
            out.push('>');
            for (key, child) in map {
                if key == TYPE_KEY {
                    continue;
                }
                encode_value(out, key, child);
            }
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
    }
}

fn push_leaf(out: &mut String, name: &str, xsi_type: Option<&str>, text: &str) {
    out.push('<');
    out.push_str(name);
    if let Some(t) = xsi_type {
        out.push_str(" xsi:type=\"");
        out.push_str(&escape(t));
        out.push('"');
    }
    out.push('>');
    out.push_str(&escape(text));
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::any_string;
    use serde_json::json;

    #[test]
    fn test_encode_login() {
        let xml = encode_call(
            "urn:vim25",
            "Login",
            &MoRef::new("SessionManager", "SessionManager"),
            &[
                ("userName".to_string(), json!("root")),
                ("password".to_string(), json!("p<w>&")),
            ],
        );
        assert!(xml.contains(r#"<Login xmlns="urn:vim25">"#));
        assert!(xml.contains(r#"<_this type="SessionManager">SessionManager</_this>"#));
        assert!(xml.contains("<userName>root</userName>"));
        assert!(xml.contains("<password>p&lt;w&gt;&amp;</password>"));
    }

    #[test]
    fn test_encode_typed_object_keeps_field_order() {
        let spec = json!({
            "_type": "ClusterDrsConfigInfo",
            "enabled": true,
            "vmotionRate": 3,
            "option": [
                { "_type": "OptionValue", "key": "TryBalanceVmsPerHost", "value": any_string("1") }
            ]
        });
        let mut out = String::new();
        encode_value(&mut out, "drsConfig", &spec);
        assert_eq!(
            out,
            concat!(
                r#"<drsConfig xsi:type="ClusterDrsConfigInfo">"#,
                "<enabled>true</enabled><vmotionRate>3</vmotionRate>",
                r#"<option xsi:type="OptionValue"><key>TryBalanceVmsPerHost</key>"#,
                r#"<value xsi:type="xsd:string">1</value></option>"#,
                "</drsConfig>"
            )
        );
    }

    #[test]
    fn test_encode_inventory_path_with_ampersand() {
        let mut out = String::new();
        encode_value(&mut out, "inventoryPath", &json!("R&D/vm/web01"));
        assert_eq!(out, "<inventoryPath>R&amp;D/vm/web01</inventoryPath>");
    }

    #[test]
    fn test_encode_skips_null_fields() {
        let mut out = String::new();
        encode_value(&mut out, "spec", &json!({ "name": "x", "description": null }));
        assert_eq!(out, "<spec><name>x</name></spec>");
    }
}
