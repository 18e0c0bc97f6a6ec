// src/lib.rs

pub mod atlas;
pub mod coefficients;
pub mod config;
pub mod effective_field;
pub mod equilibrium;
pub mod error;
pub mod grid;
pub mod initial_states;
pub mod integrator;
pub mod noise;
pub mod params;
pub mod region_cache;
pub mod state;
pub mod temperature;
pub mod thermal;
pub mod vec3;
