//! Source/sink seams and the registry that builds them from config.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rpx_core::config::{parse_limit, Config, InputConfig, InputKind, OutputConfig, OutputKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::limiter::{LimitedSink, LimitedSource};

/// Producer of wire records. Each source is driven by one copy loop.
#[async_trait]
pub(crate) trait Source: Send {
    /// Next record, or `None` once the source is exhausted.
    async fn read(&mut self) -> Result<Option<Bytes>>;

    fn name(&self) -> &str;
}

/// Destination of wire records, shared by every copy loop.
#[async_trait]
pub(crate) trait Sink: Send + Sync {
    async fn write(&self, payload: Bytes) -> Result<usize>;

    /// Waits for records accepted by `write` to be fully handled.
    async fn close(&self) {}

    fn name(&self) -> &str;
}

/// An output, plus the input it feeds when it also produces records
/// (replayed responses).
pub(crate) struct BuiltOutput {
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) source: Option<Box<dyn Source>>,
}

impl BuiltOutput {
    pub(crate) fn sink(sink: Arc<dyn Sink>) -> Self {
        Self { sink, source: None }
    }
}

pub(crate) type InputFactory = fn(&InputConfig) -> Result<Box<dyn Source>>;
pub(crate) type OutputFactory = fn(&OutputConfig) -> Result<BuiltOutput>;

pub(crate) struct Plugins {
    pub(crate) inputs: Vec<Box<dyn Source>>,
    pub(crate) outputs: Vec<Arc<dyn Sink>>,
    /// Sources produced by outputs; they end when their output closes.
    pub(crate) derived: Vec<Box<dyn Source>>,
}

/// Maps config `type` tags to constructors.
#[derive(Default)]
pub(crate) struct Registry {
    inputs: HashMap<InputKind, InputFactory>,
    outputs: HashMap<OutputKind, OutputFactory>,
}

impl Registry {
    pub(crate) fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register_input(InputKind::Raw, crate::input::raw::build);
        registry.register_input(InputKind::File, crate::input::file::build);
        registry.register_input(InputKind::Tcp, crate::input::tcp::build);
        registry.register_input(InputKind::Http, crate::input::http::build);
        registry.register_input(InputKind::Dummy, crate::input::dummy::build);
        registry.register_output(OutputKind::Http, crate::output::http::build);
        registry.register_output(OutputKind::File, crate::output::file::build);
        registry.register_output(OutputKind::Tcp, crate::output::tcp::build);
        registry.register_output(OutputKind::Dummy, crate::output::dummy::build);
        registry
    }

    pub(crate) fn register_input(&mut self, kind: InputKind, factory: InputFactory) {
        self.inputs.insert(kind, factory);
    }

    pub(crate) fn register_output(&mut self, kind: OutputKind, factory: OutputFactory) {
        self.outputs.insert(kind, factory);
    }

    /// Fails when a configured `type` has no constructor.
    pub(crate) fn check(&self, config: &Config) -> Result<()> {
        for input in &config.inputs {
            self.input_factory(input.kind)?;
        }
        for output in &config.outputs {
            self.output_factory(output.kind)?;
        }
        Ok(())
    }

    /// Builds every configured plugin. Must run inside the tokio runtime,
    /// several plugins spawn their background tasks here.
    pub(crate) fn build(&self, config: &Config) -> Result<Plugins> {
        let mut inputs = Vec::with_capacity(config.inputs.len());
        for input in &config.inputs {
            let name = input.display_name();
            let factory = self.input_factory(input.kind)?;
            let mut source = factory(input).with_context(|| format!("input {name}"))?;
            if let Some(limit) = input.limit.as_deref() {
                source = Box::new(LimitedSource::new(source, parse_limit(limit)?));
            }
            info!(input = %source.name(), "input ready");
            inputs.push(source);
        }

        let mut outputs = Vec::with_capacity(config.outputs.len());
        let mut derived = Vec::new();
        for output in &config.outputs {
            let name = output.display_name();
            let factory = self.output_factory(output.kind)?;
            let built = factory(output).with_context(|| format!("output {name}"))?;
            let mut sink = built.sink;
            if let Some(limit) = output.limit.as_deref() {
                sink = Arc::new(LimitedSink::new(sink, parse_limit(limit)?));
            }
            info!(output = %sink.name(), "output ready");
            outputs.push(sink);
            if let Some(source) = built.source {
                info!(input = %source.name(), output = %name, "derived input ready");
                derived.push(source);
            }
        }
        Ok(Plugins {
            inputs,
            outputs,
            derived,
        })
    }

    fn input_factory(&self, kind: InputKind) -> Result<InputFactory> {
        self.inputs
            .get(&kind)
            .copied()
            .ok_or_else(|| anyhow!("no plugin registered for input type {}", kind.as_str()))
    }

    fn output_factory(&self, kind: OutputKind) -> Result<OutputFactory> {
        self.outputs
            .get(&kind)
            .copied()
            .ok_or_else(|| anyhow!("no plugin registered for output type {}", kind.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpx_core::config::{
        CaptureConfig, EmitterConfig, FileReplayConfig, HttpOutputConfig, LoggingConfig,
        RuntimeConfig,
    };

    struct Nothing(String);

    #[async_trait]
    impl Source for Nothing {
        async fn read(&mut self) -> Result<Option<Bytes>> {
            Ok(None)
        }

        fn name(&self) -> &str {
            &self.0
        }
    }

    #[async_trait]
    impl Sink for Nothing {
        async fn write(&self, payload: Bytes) -> Result<usize> {
            Ok(payload.len())
        }

        fn name(&self) -> &str {
            &self.0
        }
    }

    fn nothing_input(cfg: &InputConfig) -> Result<Box<dyn Source>> {
        Ok(Box::new(Nothing(cfg.display_name())))
    }

    fn nothing_output(cfg: &OutputConfig) -> Result<BuiltOutput> {
        Ok(BuiltOutput {
            sink: Arc::new(Nothing(cfg.display_name())),
            source: Some(Box::new(Nothing("echo".into()))),
        })
    }

    fn config(limit: Option<&str>) -> Config {
        Config {
            version: 1,
            logging: LoggingConfig::default(),
            metrics: None,
            runtime: RuntimeConfig::default(),
            emitter: EmitterConfig::default(),
            modifier: None,
            inputs: vec![InputConfig {
                kind: InputKind::Dummy,
                name: Some("in".into()),
                address: None,
                path: None,
                limit: limit.map(str::to_string),
                capture: CaptureConfig::default(),
                replay: FileReplayConfig::default(),
            }],
            outputs: vec![OutputConfig {
                kind: OutputKind::Dummy,
                name: Some("out".into()),
                url: None,
                address: None,
                path: None,
                append: false,
                limit: limit.map(str::to_string),
                http: HttpOutputConfig::default(),
            }],
        }
    }

    #[tokio::test]
    async fn builds_registered_plugins_with_limits() {
        let mut registry = Registry::default();
        registry.register_input(InputKind::Dummy, nothing_input);
        registry.register_output(OutputKind::Dummy, nothing_output);

        let plugins = registry.build(&config(Some("10%"))).expect("build");
        let inputs: Vec<&str> = plugins.inputs.iter().map(|s| s.name()).collect();
        assert_eq!(inputs, ["in (limit 10%)"]);
        let derived: Vec<&str> = plugins.derived.iter().map(|s| s.name()).collect();
        assert_eq!(derived, ["echo"]);
        assert_eq!(plugins.outputs.len(), 1);
        assert_eq!(plugins.outputs[0].name(), "out (limit 10%)");
    }

    #[test]
    fn unregistered_kind_is_an_error() {
        let mut registry = Registry::default();
        registry.register_input(InputKind::Dummy, nothing_input);
        let err = registry.check(&config(None)).expect_err("no dummy output");
        assert!(err.to_string().contains("output type dummy"));
    }

    #[test]
    fn builtin_registry_covers_every_kind() {
        let registry = Registry::builtin();
        let inputs = [
            InputKind::Raw,
            InputKind::File,
            InputKind::Tcp,
            InputKind::Http,
            InputKind::Dummy,
        ];
        for kind in inputs {
            assert!(registry.input_factory(kind).is_ok(), "{}", kind.as_str());
        }
        for kind in [OutputKind::Http, OutputKind::File, OutputKind::Tcp, OutputKind::Dummy] {
            assert!(registry.output_factory(kind).is_ok(), "{}", kind.as_str());
        }
    }
}
