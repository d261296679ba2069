pub mod alunos;
pub mod backup_exchange;
pub mod core;
pub mod etapas;
pub mod lancamentos;
pub mod notas;
pub mod vinculos;
