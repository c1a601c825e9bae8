use metrics::Label;

/// Common label set attached to every metric emission.
#[derive(Debug, Clone, Default)]
pub struct TelemetryLabels {
    pub environment: Option<String>,
    pub container: Option<String>,
    pub correlation_id: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    fn tags(&self) -> Vec<Label> {
        let mut tags = Vec::with_capacity(3 + self.extra.len());
        if let Some(environment) = &self.environment {
            tags.push(Label::new("environment", environment.clone()));
        }
        if let Some(container) = &self.container {
            tags.push(Label::new("container", container.clone()));
        }
        if let Some(correlation_id) = &self.correlation_id {
            tags.push(Label::new("correlation_id", correlation_id.clone()));
        }
        for (key, value) in &self.extra {
            tags.push(Label::new(key.clone(), value.clone()));
        }
        tags
    }
}

pub fn record_counter(name: &'static str, value: u64, labels: &TelemetryLabels) {
    metrics::counter!(name, labels.tags()).increment(value);
}

pub fn record_gauge(name: &'static str, value: f64, labels: &TelemetryLabels) {
    metrics::gauge!(name, labels.tags()).set(value);
}

pub fn record_histogram(name: &'static str, value: f64, labels: &TelemetryLabels) {
    metrics::histogram!(name, labels.tags()).record(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_render_in_insertion_order() {
        let labels = TelemetryLabels::new()
            .with_environment("test")
            .with_container("landing")
            .with_extra("reason", "not_found");
        let tags = labels.tags();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0].key(), "environment");
        assert_eq!(tags[1].key(), "container");
        assert_eq!(tags[2].key(), "reason");
    }

    #[test]
    fn recording_without_a_recorder_is_a_noop() {
        record_counter("TestCounter", 1, &TelemetryLabels::new());
        record_gauge("TestGauge", 1.0, &TelemetryLabels::new());
        record_histogram("TestHistogram", 0.5, &TelemetryLabels::new());
    }
}
