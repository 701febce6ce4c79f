// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use coverage::map::{
    Branch, Condition, InstrumentationResult, InstrumentedAssembly, MethodInfo, Sequence,
    SourceFile,
};
use coverage::allowlist::is_windows_path;
use coverage::AllowList;
use il_module::body::MethodBody;
use il_module::debuginfo::SymbolReader;
use il_module::instruction::decode;
use il_module::loader::{AssemblyResolver, Loader};
use il_module::{MethodDef, Module, Token};
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::allocator::HitIdAllocator;
use crate::config::Config;
use crate::relink::relink;
use crate::rewrite::{insert_probes, lower, ProbePlan};
use crate::sequence::{decisions, segment, SegmentError};
use crate::stack::max_stack;

/// Failure that prevents an assembly from being instrumented at all.
#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("probe assembly `{probe}` needed by `{assembly}` could not be resolved")]
    ProbeAssemblyNotFound { assembly: String, probe: String },

    #[error("`{assembly}` is not a managed image")]
    NotManagedImage { assembly: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a method was left as it was.
#[derive(Debug, thiserror::Error)]
pub enum SkipReason {
    #[error("method has no body")]
    NoBody,

    #[error("method has no symbols")]
    NoSymbols,

    #[error("method has no instrumentable sequence points")]
    NoCoverablePoints,

    #[error("method already calls the probe")]
    AlreadyInstrumented,

    #[error("sequence point at IL_{offset:04x} is not at an instruction")]
    MisalignedSequencePoint { offset: u32 },

    #[error("sequence point at IL_{offset:04x} ends before it starts")]
    InvertedSequencePoint { offset: u32 },

    #[error("IL_{from:04x} refers to IL_{offset:04x}, inside an instruction")]
    BranchIntoInstruction { from: u32, offset: u32 },

    #[error("decision at IL_{offset:04x} can fall through past the end of the method")]
    FallthroughPastEnd { offset: u32 },

    #[error("no hit ids are left to allocate")]
    HitIdsExhausted,

    #[error("unsupported method body: {0}")]
    InvalidBody(#[from] il_module::Error),
}

impl SkipReason {
    /// Skips that indicate bad input rather than nothing to do.
    pub fn is_unexpected(&self) -> bool {
        !matches!(
            self,
            Self::NoBody | Self::NoSymbols | Self::NoCoverablePoints
        )
    }
}

impl From<SegmentError> for SkipReason {
    fn from(err: SegmentError) -> Self {
        match err {
            SegmentError::Misaligned { offset } => Self::MisalignedSequencePoint { offset },
            SegmentError::InvertedLines { offset } => Self::InvertedSequencePoint { offset },
            SegmentError::FallthroughPastEnd { offset } => Self::FallthroughPastEnd { offset },
        }
    }
}

/// A sequence and the source document it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSequence {
    pub document: String,
    pub sequence: Sequence,
}

#[derive(Debug)]
pub enum MethodOutcome {
    Instrumented(Vec<DocumentSequence>),
    Skipped(SkipReason),
}

#[derive(Debug)]
pub enum AssemblyOutcome {
    Instrumented(InstrumentedAssembly),
    AlreadyInstrumented,
}

pub struct AssemblyTarget<M, S> {
    pub module: M,
    pub symbols: S,
}

impl<M, S> AssemblyTarget<M, S> {
    pub fn new(module: M, symbols: S) -> Self {
        Self { module, symbols }
    }
}

#[derive(Debug)]
pub struct BatchOutcome {
    /// Coverage map of every assembly instrumented by the batch.
    pub result: InstrumentationResult,

    /// Outcome per assembly, in target order.
    pub outcomes: Vec<(String, Result<AssemblyOutcome, InstrumentError>)>,
}

/// Rewrites managed modules to report hits to the probe method.
pub struct Instrumenter<R> {
    config: Config,
    allowlist: AllowList,
    allocator: Arc<HitIdAllocator>,
    loader: Loader<R>,
}

impl<R: AssemblyResolver> Instrumenter<R> {
    pub fn new(config: Config, resolver: R) -> anyhow::Result<Self> {
        let allowlist = config.allowlist()?;

        Ok(Self {
            config,
            allowlist,
            allocator: Arc::new(HitIdAllocator::new()),
            loader: Loader::new(resolver),
        })
    }

    /// Share an allocator with other instrumenters of the same run.
    pub fn with_allocator(mut self, allocator: Arc<HitIdAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<HitIdAllocator> {
        &self.allocator
    }

    pub fn instrument_assembly<M, S>(
        &self,
        module: &mut M,
        symbols: &S,
    ) -> Result<AssemblyOutcome, InstrumentError>
    where
        M: Module + ?Sized,
        S: SymbolReader + ?Sized,
    {
        let assembly = module.name().to_owned();

        if module.is_instrumented() {
            info!("{} is already instrumented", assembly);
            return Ok(AssemblyOutcome::AlreadyInstrumented);
        }

        // Modules built from parts have no image to check.
        if !module.image().is_empty() {
            let managed = il_module::is_managed_image(module.image()).unwrap_or_else(|err| {
                warn!("{}: unable to parse image: {:#}", assembly, err);
                false
            });

            if !managed {
                return Err(InstrumentError::NotManagedImage { assembly });
            }
        }

        let probe_assembly = &self.config.probe.assembly;
        if !self.loader.is_resolvable(probe_assembly)? {
            return Err(InstrumentError::ProbeAssemblyNotFound {
                assembly,
                probe: probe_assembly.clone(),
            });
        }

        for reference in module.references() {
            if !self.loader.is_resolvable(&reference)? {
                warn!("{}: unable to resolve referenced assembly {}", assembly, reference);
            }
        }

        let hash = hex::encode(Sha256::digest(module.image()));

        let probe = module
            .import_probe(&self.config.probe)
            .with_context(|| format!("unable to import probe into {assembly}"))?;

        let mut files: BTreeMap<String, Vec<Sequence>> = BTreeMap::new();
        let mut instrumented = 0;
        let mut skipped = 0;

        for method in module.methods() {
            match self.instrument_method(module, probe, &method, symbols)? {
                MethodOutcome::Instrumented(sequences) => {
                    instrumented += 1;

                    for DocumentSequence { document, sequence } in sequences {
                        files.entry(document).or_default().push(sequence);
                    }
                }
                MethodOutcome::Skipped(reason) => {
                    skipped += 1;

                    if reason.is_unexpected() {
                        warn!("{}: skipping {}: {}", assembly, method.full_name(), reason);
                    } else {
                        debug!("{}: skipping {}: {}", assembly, method.full_name(), reason);
                    }
                }
            }
        }

        module.mark_instrumented();

        let source_files = files
            .into_iter()
            .map(|(path, sequences)| SourceFile { path, sequences })
            .collect();

        let instrumented_assembly = InstrumentedAssembly {
            name: assembly,
            hash,
            source_files,
        };

        info!(
            "instrumented {}: {} methods, {} sequences, {} skipped",
            instrumented_assembly.name,
            instrumented,
            instrumented_assembly.sequence_count(),
            skipped
        );

        Ok(AssemblyOutcome::Instrumented(instrumented_assembly))
    }

    /// Instrument one method of `module`, replacing its body on success.
    pub fn instrument_method<M, S>(
        &self,
        module: &mut M,
        probe: Token,
        method: &MethodDef,
        symbols: &S,
    ) -> Result<MethodOutcome, InstrumentError>
    where
        M: Module + ?Sized,
        S: SymbolReader + ?Sized,
    {
        match self.rewrite_method(&*module, probe, method, symbols) {
            Ok((body, sequences)) => {
                module
                    .replace_body(method.token, body)
                    .with_context(|| format!("unable to replace body of {}", method.full_name()))?;

                Ok(MethodOutcome::Instrumented(sequences))
            }
            Err(reason) => Ok(MethodOutcome::Skipped(reason)),
        }
    }

    fn rewrite_method<M, S>(
        &self,
        module: &M,
        probe: Token,
        method: &MethodDef,
        symbols: &S,
    ) -> Result<(Vec<u8>, Vec<DocumentSequence>), SkipReason>
    where
        M: Module + ?Sized,
        S: SymbolReader + ?Sized,
    {
        let data = method.body.as_deref().ok_or(SkipReason::NoBody)?;

        let points = match symbols.sequence_points(method.token) {
            Ok(Some(points)) if !points.is_empty() => points,
            Ok(_) => return Err(SkipReason::NoSymbols),
            Err(err) => {
                warn!("unable to read symbols of {}: {:#}", method.full_name(), err);
                return Err(SkipReason::NoSymbols);
            }
        };

        let body = MethodBody::parse(data)?;
        let original = decode(&body.code)?;

        if original.iter().any(|instruction| instruction.is_call_to(probe)) {
            return Err(SkipReason::AlreadyInstrumented);
        }

        let labelled = lower(&original, &body.clauses, body.code.len() as u32).map_err(|err| {
            SkipReason::BranchIntoInstruction {
                from: err.source,
                offset: err.offset,
            }
        })?;

        let spans = segment(&original, points, |point| {
            let ignore_case = is_windows_path(&point.document);
            self.allowlist
                .matches(self.document_path(&point.document), ignore_case)
        })?;

        if spans.is_empty() {
            return Err(SkipReason::NoCoverablePoints);
        }

        // Find every decision before reserving, so a skip wastes no ids.
        let mut span_decisions = Vec::with_capacity(spans.len());
        for span in &spans {
            let found = if self.config.branches {
                decisions(&labelled.instructions, span)?
            } else {
                vec![]
            };
            span_decisions.push(found);
        }

        let needed: usize = spans.len()
            + span_decisions
                .iter()
                .flatten()
                .map(|decision| decision.successors.len())
                .sum::<usize>();

        let mut ids = u32::try_from(needed)
            .ok()
            .and_then(|count| self.allocator.reserve(count))
            .ok_or(SkipReason::HitIdsExhausted)?;

        let info = MethodInfo::new(method.declaring_type.clone(), method.name.clone());
        let text = |index: usize| original[index].to_string();

        let mut plan = ProbePlan::default();
        let mut sequences = Vec::with_capacity(spans.len());

        for (span, found) in spans.iter().zip(span_decisions) {
            let hit_id = ids.next().ok_or(SkipReason::HitIdsExhausted)?;
            plan.sequences.insert(span.start, hit_id);

            let mut conditions = vec![];

            for decision in found {
                let decision_text = text(decision.index);
                let mut probes = vec![];
                let mut branches = vec![];

                for (position, successor) in decision.successors.iter().enumerate() {
                    let id = ids.next().ok_or(SkipReason::HitIdsExhausted)?;
                    probes.push((*successor, id));

                    branches.push(Branch {
                        hit_id: id,
                        offset: original[*successor].offset,
                        fallthrough: position == 0,
                        instruction: decision_text.clone(),
                    });
                }

                plan.decisions.insert(decision.index, probes);

                conditions.push(Condition {
                    offset: original[decision.index].offset,
                    instruction: decision_text,
                    branches,
                });
            }

            let point = &span.point;

            sequences.push(DocumentSequence {
                document: self.document_path(&point.document),
                sequence: Sequence {
                    hit_id,
                    offset: original[span.start].offset,
                    start_line: point.start_line,
                    start_column: point.start_column,
                    end_line: point.end_line,
                    end_column: point.end_column,
                    method: info.clone(),
                    instruction: text(span.start),
                    conditions,
                },
            });
        }

        let rewritten = insert_probes(&labelled, &plan, probe);

        let stack = max_stack(&rewritten.instructions, &rewritten.clauses, |token| {
            module.call_effect(token)
        });

        let max_stack = match stack {
            Some(depth) => depth.max(body.max_stack),
            None => {
                debug!(
                    "using conservative max stack for {}",
                    method.full_name()
                );
                body.max_stack.saturating_add(1)
            }
        };

        let relinked = relink(rewritten)?;

        if relinked.promoted > 0 {
            debug!(
                "{}: promoted {} short branches",
                method.full_name(),
                relinked.promoted
            );
        }

        let new_body = MethodBody {
            max_stack,
            init_locals: body.init_locals,
            local_var_sig: body.local_var_sig,
            code: relinked.code,
            clauses: relinked.clauses,
        };

        Ok((new_body.to_bytes()?, sequences))
    }

    /// Document path as recorded in the coverage map: relative to the source
    /// root when it is under it.
    pub fn document_path(&self, document: &str) -> String {
        if let Some(root) = &self.config.source_root {
            let normalized = document.replace('\\', "/");
            let root = root.replace('\\', "/");
            let root = root.trim_end_matches('/');

            if let Some(relative) = normalized
                .strip_prefix(root)
                .and_then(|rest| rest.strip_prefix('/'))
            {
                return relative.to_owned();
            }
        }

        document.to_owned()
    }
}

impl<R: AssemblyResolver + Sync> Instrumenter<R> {
    /// Instrument a set of assemblies, sharing one hit id allocator.
    ///
    /// Assemblies that fail are reported in the outcomes and left out of the
    /// coverage map; they never stop the rest of the batch.
    pub fn instrument_batch<M, S>(&self, targets: &mut [AssemblyTarget<M, S>]) -> BatchOutcome
    where
        M: Module + Send,
        S: SymbolReader + Send,
    {
        let run = |target: &mut AssemblyTarget<M, S>| {
            let name = target.module.name().to_owned();
            let outcome = self.instrument_assembly(&mut target.module, &target.symbols);

            if let Err(err) = &outcome {
                error!("unable to instrument {}: {:#}", name, err);
            }

            (name, outcome)
        };

        let outcomes: Vec<_> = if self.config.parallel {
            targets.par_iter_mut().map(run).collect()
        } else {
            targets.iter_mut().map(run).collect()
        };

        let assemblies = outcomes
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                Ok(AssemblyOutcome::Instrumented(assembly)) => Some(assembly.clone()),
                _ => None,
            })
            .collect();

        let result = InstrumentationResult {
            source_root: self.config.source_root.clone(),
            hits_dir: self.config.hits_dir.clone(),
            assemblies,
        };

        BatchOutcome { result, outcomes }
    }
}
