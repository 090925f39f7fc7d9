/// Operation is a resource operation, as seen by permits, interceptors,
/// notifications and the audit log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    List,
    Clear,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::List => "list",
            Operation::Clear => "clear",
        }
    }

    /// Operations which mutate state. Reads and lists are excluded.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Update | Operation::Delete | Operation::Clear
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "read" => Ok(Operation::Read),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "list" => Ok(Operation::List),
            "clear" => Ok(Operation::Clear),
            other => Err(format!("unknown operation {other:?}")),
        }
    }
}
