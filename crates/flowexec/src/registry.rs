use flowcore::{Job, JobError, Props};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a job type name and resolved properties to a runnable job
pub trait JobTypeManager: Send + Sync {
    fn create_job(&self, job_type: &str, job_id: &str, props: &Props) -> Result<Box<dyn Job>, JobError>;
}

/// Factory trait for creating job instances
pub trait JobTypeFactory: Send + Sync {
    /// Create a job for one attempt with its resolved properties
    fn create(&self, job_id: &str, props: &Props) -> Result<Box<dyn Job>, JobError>;

    /// Get job type identifier
    fn job_type(&self) -> &str;

    /// Optional: Get job type metadata
    fn metadata(&self) -> JobTypeMetadata {
        JobTypeMetadata::default()
    }
}

/// Metadata about a job type
#[derive(Debug, Clone)]
pub struct JobTypeMetadata {
    pub description: String,
    pub category: String,
    pub properties: Vec<PropertyDefinition>,
}

impl Default for JobTypeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            properties: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Registry of available job types
pub struct JobTypeRegistry {
    factories: HashMap<String, Arc<dyn JobTypeFactory>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a job type factory
    pub fn register(&mut self, factory: Arc<dyn JobTypeFactory>) {
        let job_type = factory.job_type().to_string();
        tracing::info!("Registering job type: {}", job_type);
        self.factories.insert(job_type, factory);
    }

    /// Get all registered job types, sorted
    pub fn list_job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    /// Get metadata for a job type
    pub fn get_metadata(&self, job_type: &str) -> Option<JobTypeMetadata> {
        self.factories.get(job_type).map(|f| f.metadata())
    }
}

impl JobTypeManager for JobTypeRegistry {
    fn create_job(&self, job_type: &str, job_id: &str, props: &Props) -> Result<Box<dyn Job>, JobError> {
        let factory = self
            .factories
            .get(job_type)
            .ok_or_else(|| JobError::UnknownJobType(job_type.to_string()))?;

        let metadata = factory.metadata();
        if let Some(missing) = metadata
            .properties
            .iter()
            .find(|p| p.required && !props.contains_key(&p.name))
        {
            return Err(JobError::MissingProperty(missing.name.clone()));
        }

        factory.create(job_id, props)
    }
}

impl Default for JobTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
