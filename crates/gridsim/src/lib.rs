//! Gridsim - Substation Device Simulator
//!
//! This crate provides the simulation runtime and protocol plumbing:
//! - Data model, SBO control and GOOSE publishing (`substation`)
//! - Structured Text device scripts with a debugger (`engine`)
//! - Modbus TCP and MMS association relay on real sockets (`relay`)
//! - JSON control plane over WebSocket (`server`)
//! - Project loading and hot reload (`project`)

// Data model & protocol behaviour
pub mod control;
pub mod datamodel;
pub mod goose;
pub mod modbus;
pub mod substation;

// Script scheduler & debugger
pub mod engine;

// Protocol relay
pub mod relay;

// Control-plane WebSocket server
pub mod server;

// In-process engine ⇄ relay wiring
pub mod bridge;

// Project management
pub mod project;

// Runtime configuration
pub mod config;
