//! Compilation-session state: configuration, graph-level buffer facts and
//! the counters that make generated names unique within one session.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use weft_dtype::DType;

use crate::error::{Error, Result};
use crate::isa::{self, VecIsa};

/// Code-generation configuration for one session.
#[derive(Debug, Clone)]
pub struct CppConfig {
    /// Fixed thread count; 0 defers to the machine's available parallelism.
    pub threads: usize,
    /// Let the OpenMP runtime size the thread pool at run time.
    pub dynamic_threads: bool,
    /// Minimum per-thread serial work before another level is parallelized.
    pub min_chunk_size: i64,
    /// Emit `#pragma GCC ivdep` on serial non-reduction loops.
    pub gcc_vectorize: bool,
    /// Vector ISA for the SIMD main loop; `None` forces scalar codegen.
    pub simd: Option<VecIsa>,
}

impl Default for CppConfig {
    fn default() -> CppConfig {
        CppConfig {
            threads: 0,
            dynamic_threads: false,
            min_chunk_size: 4096,
            gcc_vectorize: false,
            simd: isa::pick_vec_isa(),
        }
    }
}

impl CppConfig {
    pub fn parallel_num_threads(&self) -> usize {
        if self.threads >= 1 {
            self.threads
        } else {
            std::thread::available_parallelism().map(usize::from).unwrap_or(1)
        }
    }
}

/// Graph-level facts the generator needs about buffers: element types and
/// which destinations the upstream builder pruned as dead.
#[derive(Debug, Clone, Default)]
pub struct GraphInfo {
    buffer_dtypes: HashMap<String, DType>,
    removed_buffers: HashSet<String>,
}

impl GraphInfo {
    pub fn new() -> GraphInfo {
        GraphInfo::default()
    }

    pub fn declare_buffer(&mut self, name: impl Into<String>, dtype: DType) -> &mut Self {
        self.buffer_dtypes.insert(name.into(), dtype);
        self
    }

    /// Mark a destination buffer as eliminated; stores and reduction
    /// flushes into it are dropped.
    pub fn remove_buffer(&mut self, name: impl Into<String>) -> &mut Self {
        self.removed_buffers.insert(name.into());
        self
    }

    pub fn dtype_of(&self, name: &str) -> Result<DType> {
        self.buffer_dtypes
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownBuffer { name: name.to_string() })
    }

    pub fn is_removed(&self, name: &str) -> bool {
        self.removed_buffers.contains(name)
    }
}

/// Counters owned by the session; reset simply by starting a new session.
#[derive(Debug, Default)]
pub struct Counters {
    index_value: Cell<usize>,
    kernel: Cell<usize>,
}

impl Counters {
    /// Unique id for an argmax/argmin accumulator struct. Starts at 1.
    pub fn next_index_value_id(&self) -> usize {
        let id = self.index_value.get() + 1;
        self.index_value.set(id);
        id
    }

    pub fn next_kernel_id(&self) -> usize {
        let id = self.kernel.get();
        self.kernel.set(id + 1);
        id
    }
}

/// One code-generation session. Owns every piece of mutable state shared
/// between the kernels of the session; nothing here is process-global.
#[derive(Debug, Clone)]
pub struct CodegenSession {
    pub cfg: Rc<CppConfig>,
    pub graph: Rc<GraphInfo>,
    pub counters: Rc<Counters>,
}

impl CodegenSession {
    pub fn new(cfg: CppConfig, graph: GraphInfo) -> CodegenSession {
        CodegenSession {
            cfg: Rc::new(cfg),
            graph: Rc::new(graph),
            counters: Rc::new(Counters::default()),
        }
    }
}
