//! Housekeeping for crystal geometry optimisations split into one Gaussian or
//! ORCA job per molecule: submitting the jobs to Slurm under a throttle,
//! classifying how far each one got, resetting the unfinished ones from their
//! latest geometry, and merging the finished molecules back into their
//! crystals.

pub mod atom;
pub mod classify;
pub mod dump;
pub mod geom;
pub mod program;
pub mod queue;
pub mod reconstruct;
pub mod reset;
pub mod rev_lines;
pub mod scan;
pub mod settings;
pub mod walk;

#[cfg(test)]
mod tests;
