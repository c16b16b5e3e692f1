//! Strata Mapping - background mesh reconstruction and cubemap baking
//!
//! ## Modules
//!
//! - [`mesh`]: chunked mesh model and its flattened snapshot
//! - [`reconstruction`]: the scan/filter/texture/save/load step machine
//! - [`cubemap`]: six-face readback and conversion into a cubemap
//!
//! The mapping engine itself sits behind the [`Mapper`] trait;
//! [`SimulatedMapper`] stands in for a real engine in tests and demos.
//!
//! ## Example
//!
//! ```ignore
//! use strata_mapping::{MappingEvent, ReconstructionManager, SimulatedMapper};
//!
//! let mut reconstruction = ReconstructionManager::default();
//! reconstruction.enable(Box::new(SimulatedMapper::default()))?;
//! reconstruction.start();
//!
//! loop {
//!     for event in reconstruction.tick(std::time::Instant::now()) {
//!         if event == MappingEvent::MeshUpdated {
//!             println!("{} vertices", reconstruction.vertex_count());
//!         }
//!     }
//! }
//! ```

pub mod cubemap;
mod error;
mod mapper;
pub mod mesh;
pub mod reconstruction;
mod sim;

pub use cubemap::{
    CubeFace, CubeFormat, CubeTarget, Cubemap, CubemapBuilder, CubemapEvent, SimulatedCubeTarget,
};
pub use error::{CubemapError, MappingError};
pub use mapper::{Mapper, MapperOp, MeshPoll, poll_mesh};
pub use mesh::{
    FilterIntensity, FilterParams, Mesh, MeshChunk, MeshData, MeshFileFormat, MeshTexture,
    TextureFormat, TexturingMode,
};
pub use reconstruction::{
    MappingEvent, ReconstructionConfig, ReconstructionManager, ReconstructionStep,
    ReconstructionWorker,
};
pub use sim::{FaultSwitch, SimulatedMapper, SimulatedMapperConfig};
