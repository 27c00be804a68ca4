/// DatabaseArgs - Arguments used to connect to the project queue
#[derive(Debug, Clone)]
pub struct DatabaseArgs {
    pub connection_uri: String,
    pub schema: String,
}
