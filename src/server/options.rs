use typed_builder::TypedBuilder;

/// Options for hosting the engine as a TCP server.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ServerOptions {
    /// The listen host. Defaults to loopback.
    #[builder(default = "127.0.0.1".to_string())]
    pub host: String,

    /// The listen port. Port 0 asks the kernel for a free port.
    #[builder(default = 0)]
    pub port: u16,

    /// The default database advertised in the connection string.
    #[builder(default = "test".to_string())]
    pub default_db: String,

    /// The replica set name. When set, the server operates in the replica-set profile: `hello`
    /// reports the single-node topology and the connection string carries `replicaSet=`.
    #[builder(default)]
    #[builder(setter(strip_option))]
    pub replica_set: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ServerOptions {
    /// Reads options from `JONGODB_HOST`, `JONGODB_PORT`, `JONGODB_DB`, and `JONGODB_REPL_SET`.
    /// Unset variables keep their defaults; a malformed port is an error.
    pub fn from_env() -> crate::error::Result<Self> {
        let mut options = Self::default();
        if let Ok(host) = std::env::var("JONGODB_HOST") {
            if !host.is_empty() {
                options.host = host;
            }
        }
        if let Ok(port) = std::env::var("JONGODB_PORT") {
            if !port.is_empty() {
                options.port = port.parse().map_err(|_| {
                    crate::error::Error::bad_value(format!("invalid JONGODB_PORT '{}'", port))
                })?;
            }
        }
        if let Ok(db) = std::env::var("JONGODB_DB") {
            if !db.is_empty() {
                options.default_db = db;
            }
        }
        if let Ok(set_name) = std::env::var("JONGODB_REPL_SET") {
            if !set_name.is_empty() {
                options.replica_set = Some(set_name);
            }
        }
        Ok(options)
    }
}
