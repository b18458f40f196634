use crate::{
    bson::{doc, Bson, Document},
    dispatch::{Command, Dispatcher, ExecCtx, MAX_BSON_OBJECT_SIZE},
    error::{Error, Result},
    session::LOGICAL_SESSION_TIMEOUT_MINUTES,
};

pub(crate) fn ping(_: &Dispatcher, _: &mut ExecCtx<'_>, _: &Command) -> Result<Document> {
    Ok(Document::new())
}

pub(crate) fn build_info(_: &Dispatcher, _: &mut ExecCtx<'_>, _: &Command) -> Result<Document> {
    Ok(doc! {
        "version": "7.0.0",
        "gitVersion": "jongodb-in-memory",
        "versionArray": [7, 0, 0, 0],
        "bits": 64,
        "debug": false,
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "storageEngines": ["inMemory"],
    })
}

/// The engine parameters that can be read back. `getParameter: "*"` returns them all.
fn known_parameters() -> Document {
    doc! {
        "logLevel": 0,
        "quiet": false,
        "logicalSessionTimeoutMinutes": LOGICAL_SESSION_TIMEOUT_MINUTES,
        "featureCompatibilityVersion": { "version": "7.0" },
    }
}

pub(crate) fn get_parameter(
    _: &Dispatcher,
    _: &mut ExecCtx<'_>,
    cmd: &Command,
) -> Result<Document> {
    let parameters = known_parameters();
    let all = matches!(cmd.body.get(&cmd.wire_name), Some(Bson::String(s)) if s == "*");
    if all {
        return Ok(parameters);
    }

    let mut response = Document::new();
    for (key, value) in cmd.body.iter() {
        if key == &cmd.wire_name || super::GENERIC_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if !crate::engine::aggregate::expr::is_truthy(value) {
            continue;
        }
        match parameters.get(key) {
            Some(value) => {
                response.insert(key.clone(), value.clone());
            }
            None => {
                return Err(Error::bad_value(format!(
                    "no option found to get: {}",
                    key
                )))
            }
        }
    }
    if response.is_empty() {
        return Err(Error::bad_value("no option found to get"));
    }
    Ok(response)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::{
        bson::doc,
        operation::test_util::{dispatch_err, dispatch_ok, dispatcher},
    };

    #[test]
    fn ping_returns_bare_ok() {
        let dispatcher = dispatcher();
        let response = dispatch_ok(&dispatcher, "admin", doc! { "ping": 1 });
        assert_eq!(response, doc! { "ok": 1.0 });
    }

    #[test]
    fn build_info_reports_version_triple() {
        let dispatcher = dispatcher();
        let response = dispatch_ok(&dispatcher, "admin", doc! { "buildInfo": 1 });
        assert_eq!(response.get_str("version"), Ok("7.0.0"));
        assert!(response.get_array("versionArray").is_ok());
    }

    #[test]
    fn get_parameter_star_returns_all() {
        let dispatcher = dispatcher();
        let response = dispatch_ok(&dispatcher, "admin", doc! { "getParameter": "*" });
        assert!(response.contains_key("logLevel"));
        assert!(response.contains_key("featureCompatibilityVersion"));
    }

    #[test]
    fn get_parameter_unknown_is_rejected() {
        let dispatcher = dispatcher();
        let response = dispatch_err(
            &dispatcher,
            "admin",
            doc! { "getParameter": 1, "noSuchParameter": 1 },
        );
        assert_eq!(response.get_str("codeName"), Ok("BadValue"));
    }
}
