//! Demo payload used by `rotad`: a named job that only logs.

use serde::{Deserialize, Serialize};
use tracing::info;

use rotagrid_state::Payload;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u32,
    pub name: String,
}

impl Job {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: format!("job-{id}"),
        }
    }

    pub fn from_ids(ids: impl IntoIterator<Item = u32>) -> Vec<Self> {
        ids.into_iter().map(Self::new).collect()
    }
}

impl Payload for Job {
    type Id = u32;

    fn id(&self) -> u32 {
        self.id
    }

    fn start(&self) -> anyhow::Result<()> {
        info!(job = self.id, name = %self.name, "job started");
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        info!(job = self.id, name = %self.name, "job stopped");
        Ok(())
    }
}
