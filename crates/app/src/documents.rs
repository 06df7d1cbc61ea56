use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use loanbook_core::agreement::{render_agreement, AgreementDocument};
use loanbook_core::ports::{DocumentError, DocumentGenerator};

/// Writes rendered agreements to a local directory served under
/// `<public_base>/agreements/`.
#[derive(Debug, Clone)]
pub struct FileAgreementWriter {
    dir: PathBuf,
    public_base: String,
}

impl FileAgreementWriter {
    pub fn new(dir: impl Into<PathBuf>, public_base: &str) -> Self {
        Self {
            dir: dir.into(),
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

#[async_trait]
impl DocumentGenerator for FileAgreementWriter {
    async fn generate(&self, document: &AgreementDocument) -> Result<String, DocumentError> {
        let file_name = format!("{}.txt", Uuid::new_v4());
        let path = self.dir.join(&file_name);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| DocumentError(Box::new(err)))?;
        tokio::fs::write(&path, render_agreement(document))
            .await
            .map_err(|err| DocumentError(Box::new(err)))?;

        debug!(stage = "agreement", path = %path.display(), "agreement written");
        Ok(format!("{}/agreements/{file_name}", self.public_base))
    }
}
