//! XML messages exchanged with the distribution service.

use std::{
    borrow::Cow,
    str,
};

use xmltree::{Element, XMLNode};

use crate::{
    auth::Nonce,
    version::VersionTriple,
};

const NON_UTF8_MSG: &str = "[Non-UTF-8 data]";

pub(crate) fn to_utf8_or_error_string(data: &[u8]) -> &str {
    str::from_utf8(data).unwrap_or(NON_UTF8_MSG)
}

/// Text of the element reached by following `path` from `elem`. An element
/// that exists but has no text yields an empty string.
pub(crate) fn elem_text<'a>(elem: &'a Element, path: &[&str]) -> Option<Cow<'a, str>> {
    let mut result = Some(elem);

    for p in path {
        result = result.and_then(|e| e.get_child(*p));
    }

    result.map(|e| e.get_text().unwrap_or(Cow::Borrowed("")))
}

/// Value of a `<FUSBody><Put><FIELD><Data>` field.
pub(crate) fn fus_field<'a>(elem: &'a Element, field: &str) -> Option<Cow<'a, str>> {
    elem_text(elem, &["FUSBody", "Put", field, "Data"])
}

/// Status code in `<FUSBody><Results><Status>`.
pub(crate) fn fus_status(elem: &Element) -> Option<Cow<'_, str>> {
    elem_text(elem, &["FUSBody", "Results", "Status"])
}

fn text_node(name: &str, text: &str) -> XMLNode {
    let mut elem = Element::new(name);
    elem.children.push(XMLNode::Text(text.to_owned()));
    XMLNode::Element(elem)
}

fn data_node(name: &str, value: &str) -> XMLNode {
    let mut elem = Element::new(name);
    elem.children.push(text_node("Data", value));
    XMLNode::Element(elem)
}

fn fus_msg(put: Vec<XMLNode>, get_field: &str) -> Element {
    let mut put_elem = Element::new("Put");
    put_elem.children.push(text_node("CmdID", "1"));
    put_elem.children.extend(put);

    let mut get_elem = Element::new("Get");
    get_elem.children.push(text_node("CmdID", "2"));
    get_elem.children.push(text_node(get_field, ""));

    let mut fus_body = Element::new("FUSBody");
    fus_body.children.push(XMLNode::Element(put_elem));
    fus_body.children.push(XMLNode::Element(get_elem));

    let mut fus_hdr = Element::new("FUSHdr");
    fus_hdr.children.push(text_node("ProtoVer", "1.0"));

    let mut msg = Element::new("FUSMsg");
    msg.children.push(XMLNode::Element(fus_hdr));
    msg.children.push(XMLNode::Element(fus_body));

    msg
}

/// Request body asking for the metadata of a specific build.
pub(crate) fn binary_inform(
    model: &str,
    region: &str,
    version: &VersionTriple,
    nonce: &Nonce,
) -> Element {
    let fw_version = version.to_fw_version();

    fus_msg(vec![
        data_node("ACCESS_MODE", "2"),
        data_node("BINARY_NATURE", "1"),
        data_node("CLIENT_PRODUCT", "Smart Switch"),
        data_node("CLIENT_VERSION", "4.3.23123_1"),
        data_node("DEVICE_IMEI_PUSH", "12345678901234"),
        data_node("DEVICE_FW_VERSION", &fw_version),
        data_node("DEVICE_LOCAL_CODE", region),
        data_node("DEVICE_MODEL_NAME", model),
        data_node("LOGIC_CHECK", &nonce.logic_check_for_version(&fw_version)),
    ], "LATEST_FW_VERSION")
}

/// Request body activating the download of `filename`.
pub(crate) fn binary_init(filename: &str, nonce: &Nonce) -> Element {
    fus_msg(vec![
        data_node("BINARY_FILE_NAME", filename),
        data_node("LOGIC_CHECK", &nonce.logic_check_for_filename(filename)),
    ], "BINARY_EMERGENCY_OTP_SEND")
}

pub(crate) fn serialize(elem: &Element) -> Result<Vec<u8>, xmltree::Error> {
    let mut buf = vec![];
    elem.write(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_inform() {
        let nonce = Nonce::from_slice(b"testing_testing_").unwrap();
        let version = VersionTriple::new("A", "B", "");
        let msg = binary_inform("SM-F916N", "KOO", &version, &nonce);

        assert_eq!(fus_field(&msg, "DEVICE_FW_VERSION").unwrap(), "A/B/A/A");
        assert_eq!(fus_field(&msg, "DEVICE_MODEL_NAME").unwrap(), "SM-F916N");
        assert_eq!(fus_field(&msg, "DEVICE_LOCAL_CODE").unwrap(), "KOO");
        assert_eq!(fus_field(&msg, "LOGIC_CHECK").unwrap(),
                   nonce.logic_check_for_version("A/B/A/A"));
        assert!(elem_text(&msg, &["FUSBody", "Get", "LATEST_FW_VERSION"]).is_some());
    }

    #[test]
    fn test_binary_init() {
        let nonce = Nonce::from_slice(b"testing_testing_").unwrap();
        let msg = binary_init("SM-F916N_10_x.zip.enc4", &nonce);

        assert_eq!(fus_field(&msg, "BINARY_FILE_NAME").unwrap(), "SM-F916N_10_x.zip.enc4");
        assert_eq!(fus_field(&msg, "LOGIC_CHECK").unwrap(),
                   nonce.logic_check_for_filename("SM-F916N_10_x.zip.enc4"));

        let data = serialize(&msg).unwrap();
        let parsed = Element::parse(data.as_slice()).unwrap();
        assert_eq!(fus_field(&parsed, "BINARY_FILE_NAME").unwrap(), "SM-F916N_10_x.zip.enc4");
    }

    #[test]
    fn test_elem_text() {
        let root = Element::parse(
            "<FUSMsg><FUSBody><Results><Status>200</Status></Results>\
             <Put><EMPTY><Data/></EMPTY></Put></FUSBody></FUSMsg>".as_bytes()).unwrap();

        assert_eq!(fus_status(&root).unwrap(), "200");
        assert_eq!(fus_field(&root, "EMPTY").unwrap(), "");
        assert_eq!(fus_field(&root, "MISSING"), None);
        assert_eq!(to_utf8_or_error_string(b"\xff"), NON_UTF8_MSG);
    }
}
