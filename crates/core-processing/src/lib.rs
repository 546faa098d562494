//! The statement pipeline: preprocessor stages, the opencode provider
//! with AINSERT/COPY multiplexing and attribute lookahead, statement
//! processors, and the cooperative analyzer driver.

pub mod analyzer;
pub mod ca;
pub mod copy;
pub mod macros;
pub mod opcode;
pub mod parsers;
pub mod preprocessor;
pub mod provider;
pub mod virtual_files;

pub use analyzer::{
    AnalysisRequest, AnalysisResult, Analyzer, AnalyzerOptions, CancelToken, StageKind,
    SymbolInfo, SymbolView,
};
pub use copy::{CopyFrame, CopybookResolver, FileLibrary, InMemoryLibrary};
pub use preprocessor::{CicsStage, Db2Stage, IncludeStage, Stage, run_pipeline};
pub use provider::{AinsertDestination, OpencodeProvider, ProviderYield, RewindPos};
pub use virtual_files::{VirtualFileHandle, VirtualFileMonitor, VirtualFileRegistry, virtual_uri};
