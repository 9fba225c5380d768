//! ABI-driven encoding of contract calls and decoding of their results into the
//! tuple-or-named JSON shape the decoders in [`crate::decode`] resolve against.

use crate::{
    error::ClientError,
    wallet::{
        CallArg,
        ContractCall,
        ContractName,
        LogEntry,
    },
};
use alloy::{
    dyn_abi::{
        DynSolType,
        DynSolValue,
        EventExt,
        FunctionExt,
        JsonAbiExt,
        Specifier,
    },
    json_abi::{
        Event,
        Function,
        JsonAbi,
        Param,
    },
    primitives::Bytes,
};
use serde_json::{
    Map,
    Value,
};

/// The subset of ERC20 the client touches.
pub const ERC20_ABI: &str = r#"[
  {"type":"function","name":"balanceOf","stateMutability":"view",
   "inputs":[{"name":"account","type":"address"}],
   "outputs":[{"name":"","type":"uint256"}]},
  {"type":"function","name":"allowance","stateMutability":"view",
   "inputs":[{"name":"owner","type":"address"},{"name":"spender","type":"address"}],
   "outputs":[{"name":"","type":"uint256"}]},
  {"type":"function","name":"approve","stateMutability":"nonpayable",
   "inputs":[{"name":"spender","type":"address"},{"name":"amount","type":"uint256"}],
   "outputs":[{"name":"","type":"bool"}]},
  {"type":"function","name":"decimals","stateMutability":"view",
   "inputs":[],"outputs":[{"name":"","type":"uint8"}]},
  {"type":"function","name":"symbol","stateMutability":"view",
   "inputs":[],"outputs":[{"name":"","type":"string"}]}
]"#;

#[derive(Clone, Debug)]
pub struct ContractAbi {
    abi: JsonAbi,
}

impl ContractAbi {
    /// Accepts a bare ABI array or a build artifact carrying it under `abi`.
    pub fn parse(json: &str) -> Result<Self, ClientError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| ClientError::Config(format!("ABI is not valid JSON: {e}")))?;
        let abi_value = match value {
            Value::Object(mut artifact) => artifact.remove("abi").ok_or_else(|| {
                ClientError::Config("ABI artifact has no `abi` entry".to_string())
            })?,
            other => other,
        };
        let abi = serde_json::from_value::<JsonAbi>(abi_value)
            .map_err(|e| ClientError::Config(format!("malformed ABI: {e}")))?;
        Ok(Self { abi })
    }

    pub fn erc20() -> Result<Self, ClientError> {
        Self::parse(ERC20_ABI)
    }

    /// Overloads are told apart by argument count.
    pub fn function(&self, name: &str, arity: usize) -> Result<&Function, ClientError> {
        self.abi
            .function(name)
            .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == arity))
            .ok_or_else(|| {
                ClientError::Config(format!(
                    "ABI has no function `{name}` taking {arity} argument(s)"
                ))
            })
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.abi.event(name).is_some()
    }

    /// Selector followed by the encoded arguments.
    pub fn encode_call(&self, call: &ContractCall) -> Result<Bytes, ClientError> {
        let function = self.function(call.function, call.args.len())?;
        let values = function
            .inputs
            .iter()
            .zip(&call.args)
            .map(|(param, arg)| coerce_arg(param, arg))
            .collect::<Result<Vec<_>, _>>()?;
        let data = function.abi_encode_input(&values).map_err(|e| {
            ClientError::Decode(format!("cannot encode {}: {e}", call.signature()))
        })?;
        Ok(Bytes::from(data))
    }

    /// A single output is returned bare (a struct becomes its object or array, a
    /// scalar its string). Several outputs become an object when all are named and an
    /// array otherwise.
    pub fn decode_output(
        &self,
        call: &ContractCall,
        data: &[u8],
    ) -> Result<Value, ClientError> {
        let function = self.function(call.function, call.args.len())?;
        let values = function.abi_decode_output(data).map_err(|e| {
            ClientError::Decode(format!("cannot decode {} output: {e}", call.signature()))
        })?;
        Ok(match function.outputs.as_slice() {
            [single] => values
                .into_iter()
                .next()
                .map(|value| to_json(&single.components, value))
                .unwrap_or(Value::Null),
            outputs => components_to_json(outputs, values),
        })
    }

    /// Decodes `log` as event `name`, or `None` when the log is a different event or
    /// does not fit the ABI.
    pub fn decode_event(&self, name: &str, log: &LogEntry) -> Option<Value> {
        let topic0 = log.topics.first()?;
        self.abi
            .event(name)?
            .iter()
            .filter(|event| !event.anonymous && event.selector() == *topic0)
            .find_map(|event| decode_log(event, log))
    }
}

fn decode_log(event: &Event, log: &LogEntry) -> Option<Value> {
    let decoded = event
        .decode_log_parts(log.topics.iter().copied(), &log.data)
        .ok()?;
    let mut indexed = decoded.indexed.into_iter();
    let mut body = decoded.body.into_iter();
    let mut fields = Map::new();
    for (position, input) in event.inputs.iter().enumerate() {
        let value = if input.indexed {
            indexed.next()?
        } else {
            body.next()?
        };
        let key = if input.name.is_empty() {
            position.to_string()
        } else {
            input.name.clone()
        };
        fields.insert(key, to_json(&input.components, value));
    }
    Some(Value::Object(fields))
}

fn coerce_arg(param: &Param, arg: &CallArg) -> Result<DynSolValue, ClientError> {
    let ty = param.resolve().map_err(|e| {
        ClientError::Config(format!("unsupported ABI type `{}`: {e}", param.ty))
    })?;
    let value = match (&ty, arg) {
        (DynSolType::Uint(bits), CallArg::Uint(value)) => DynSolValue::Uint(*value, *bits),
        (DynSolType::Address, CallArg::Address(address)) => DynSolValue::Address(*address),
        (DynSolType::Bool, CallArg::Bool(flag)) => DynSolValue::Bool(*flag),
        (DynSolType::String, CallArg::Text(text)) => DynSolValue::String(text.clone()),
        (ty, arg) => ty.coerce_str(&arg.to_string()).map_err(|e| {
            ClientError::Config(format!(
                "argument `{}` does not fit `{}`: {e}",
                param.name, param.ty
            ))
        })?,
    };
    Ok(value)
}

fn components_to_json(params: &[Param], values: Vec<DynSolValue>) -> Value {
    let all_named = !params.is_empty() && params.iter().all(|param| !param.name.is_empty());
    if all_named && params.len() == values.len() {
        let fields = params
            .iter()
            .zip(values)
            .map(|(param, value)| (param.name.clone(), to_json(&param.components, value)))
            .collect::<Map<_, _>>();
        return Value::Object(fields);
    }
    let components = |index: usize| {
        params
            .get(index)
            .map(|param| param.components.as_slice())
            .unwrap_or_default()
    };
    Value::Array(
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| to_json(components(index), value))
            .collect(),
    )
}

/// Integers become decimal strings so nothing above 2^53 loses precision.
fn to_json(components: &[Param], value: DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(flag) => Value::Bool(flag),
        DynSolValue::Uint(number, _) => Value::String(number.to_string()),
        DynSolValue::Int(number, _) => Value::String(number.to_string()),
        DynSolValue::Address(address) => Value::String(address.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..size])))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(text) => Value::String(text),
        DynSolValue::Tuple(items) => components_to_json(components, items),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => Value::Array(
            items
                .into_iter()
                .map(|item| to_json(components, item))
                .collect(),
        ),
        other => Value::String(format!("{other:?}")),
    }
}

/// The ABIs of every contract a deployment talks to.
#[derive(Clone, Debug)]
pub struct AbiSet {
    pub game: ContractAbi,
    pub erc20: ContractAbi,
}

impl AbiSet {
    pub fn new(game: ContractAbi) -> Result<Self, ClientError> {
        Ok(Self {
            game,
            erc20: ContractAbi::erc20()?,
        })
    }

    pub fn for_contract(&self, contract: ContractName) -> &ContractAbi {
        match contract {
            ContractName::Game => &self.game,
            ContractName::Token(_) => &self.erc20,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use alloy::primitives::{
        Address,
        B256,
        U256,
        keccak256,
    };

    const GAME_ABI: &str = include_str!("../abi/GameManager.json");

    fn game_abi() -> ContractAbi {
        ContractAbi::parse(GAME_ABI).unwrap()
    }

    fn word(value: u64) -> B256 {
        B256::from(U256::from(value).to_be_bytes::<32>())
    }

    #[test]
    fn encode_call__prefixes_selector_and_encodes_arguments() {
        // given
        let call = ContractCall::new(ContractName::Game, Address::ZERO, "getGame")
            .arg(CallArg::uint(17u64));

        // when
        let data = game_abi().encode_call(&call).unwrap();

        // then
        assert_eq!(&data[..4], &keccak256("getGame(uint256)")[..4]);
        assert_eq!(&data[4..], word(17).as_slice());
    }

    #[test]
    fn encode_call__rejects_unknown_functions() {
        let call = ContractCall::new(ContractName::Game, Address::ZERO, "selfDestruct");

        let err = game_abi().encode_call(&call).unwrap_err();

        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn decode_output__named_outputs_become_an_object() {
        // given
        let call = ContractCall::new(ContractName::Game, Address::ZERO, "getPlayerInfo")
            .arg(CallArg::uint(1u64))
            .arg(CallArg::Address(Address::ZERO));
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Bool(true),
            DynSolValue::Bool(true),
            DynSolValue::Uint(U256::from(1), 8),
            DynSolValue::Bool(false),
            DynSolValue::Uint(U256::ZERO, 256),
            DynSolValue::Uint(U256::from(1_000_000u64), 256),
        ])
        .abi_encode_params();

        // when
        let value = game_abi().decode_output(&call, &data).unwrap();

        // then
        assert_eq!(value["hasMadeChoice"], Value::Bool(true));
        assert_eq!(value["choice"], Value::String("1".into()));
        assert_eq!(value["entryAmount"], Value::String("1000000".into()));
    }

    #[test]
    fn decode_output__unnamed_outputs_become_an_array() {
        let call = ContractCall::new(ContractName::Game, Address::ZERO, "getRoundInfo")
            .arg(CallArg::uint(1u64))
            .arg(CallArg::uint(2u64));
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(1_700_000_000u64), 256),
            DynSolValue::Bool(false),
            DynSolValue::Uint(U256::ZERO, 8),
        ])
        .abi_encode_params();

        let value = game_abi().decode_output(&call, &data).unwrap();

        assert_eq!(
            value,
            serde_json::json!(["1700000000", false, "0"])
        );
    }

    #[test]
    fn decode_output__single_scalar_is_returned_bare() {
        let call = ContractCall::new(ContractName::Game, Address::ZERO, "gameCounter");
        let data = DynSolValue::Uint(U256::from(37), 256).abi_encode();

        let value = game_abi().decode_output(&call, &data).unwrap();

        assert_eq!(value, Value::String("37".into()));
    }

    #[test]
    fn decode_event__extracts_indexed_and_body_fields() {
        // given
        let abi = game_abi();
        let selector = abi.abi.event("GameCreated").unwrap()[0].selector();
        let creator = Address::repeat_byte(0x11);
        let log = LogEntry {
            address: Address::ZERO,
            topics: vec![selector, word(36), creator.into_word()],
            data: Bytes::from(
                DynSolValue::Tuple(vec![
                    DynSolValue::Uint(U256::from(1), 8),
                    DynSolValue::Uint(U256::from(1_000_000u64), 256),
                    DynSolValue::Uint(U256::from(10), 256),
                ])
                .abi_encode_params(),
            ),
        };

        // when
        let event = abi.decode_event("GameCreated", &log).unwrap();

        // then
        assert_eq!(event["gameId"], Value::String("36".into()));
        assert_eq!(event["creator"], Value::String(creator.to_string()));
        assert_eq!(event["maxPlayers"], Value::String("10".into()));
    }

    #[test]
    fn decode_event__returns_none_for_other_events() {
        let abi = game_abi();
        let log = LogEntry {
            address: Address::ZERO,
            topics: vec![keccak256("Transfer(address,address,uint256)")],
            data: Bytes::new(),
        };

        assert_eq!(abi.decode_event("GameCreated", &log), None);
        assert_eq!(abi.decode_event("NoSuchEvent", &log), None);
    }

    #[test]
    fn parse__accepts_build_artifacts() {
        let artifact = format!(r#"{{"contractName":"GameManager","abi":{GAME_ABI}}}"#);

        let abi = ContractAbi::parse(&artifact).unwrap();

        assert!(abi.has_event("GameCreated"));
        assert!(abi.function("joinGame", 1).is_ok());
    }
}
