// lsc — Loop Schedule Composer
//
// Library root. Program representation and versioning come first, then
// primitive edits, then the recipes and pipelines built from them.

pub mod affine;
pub mod alloc;
pub mod ast;
pub mod codegen;
pub mod cursor;
pub mod deps;
pub mod edit;
pub mod error;
pub mod id;
pub mod instr;
pub mod lexer;
pub mod memory;
pub mod parser;
pub mod printer;
pub mod proc;
pub mod recipes;
pub mod schedule;
pub mod simplify;
pub mod stage;
pub mod walk;
